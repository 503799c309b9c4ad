//! Ingresses for the admin UI and SQL endpoints

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::core::ObjectMeta;

use crate::cluster::Cluster;
use crate::crd::IngressEndpoint;
use crate::resources::common::owner_reference;
use crate::resources::reconcile::{Builder, ResourceError};
use crate::resources::service::{HTTP_PORT_NAME, SQL_PORT_NAME};

const SSL_PASSTHROUGH_ANNOTATION: &str = "nginx.ingress.kubernetes.io/ssl-passthrough";

/// Which endpoint an ingress exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngressKind {
    Ui,
    Sql,
}

pub struct IngressBuilder<'a> {
    pub cluster: &'a Cluster,
    pub kind: IngressKind,
}

impl IngressBuilder<'_> {
    fn endpoint(&self) -> Option<&IngressEndpoint> {
        let ingress = self.cluster.spec().ingress.as_ref()?;
        match self.kind {
            IngressKind::Ui => ingress.ui.as_ref(),
            IngressKind::Sql => ingress.sql.as_ref(),
        }
    }
}

impl Builder for IngressBuilder<'_> {
    type Object = Ingress;

    fn resource_name(&self) -> String {
        match self.kind {
            IngressKind::Ui => self.cluster.ui_ingress_name(),
            IngressKind::Sql => self.cluster.sql_ingress_name(),
        }
    }

    fn build(&self) -> Result<Ingress, ResourceError> {
        let cluster = self.cluster;
        let endpoint = self.endpoint().ok_or_else(|| ResourceError::InvalidSpec {
            kind: "Ingress",
            name: self.resource_name(),
            reason: "ingress is not configured".to_string(),
        })?;

        let mut annotations: BTreeMap<String, String> = endpoint.annotations.clone();
        let port_name = match self.kind {
            IngressKind::Ui => {
                annotations
                    .entry(SSL_PASSTHROUGH_ANNOTATION.to_string())
                    .or_insert_with(|| "true".to_string());
                HTTP_PORT_NAME
            }
            IngressKind::Sql => SQL_PORT_NAME,
        };

        let rule = IngressRule {
            host: Some(endpoint.host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "ImplementationSpecific".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: cluster.public_service_name(),
                            port: Some(ServiceBackendPort {
                                name: Some(port_name.to_string()),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        };

        Ok(Ingress {
            metadata: ObjectMeta {
                name: Some(self.resource_name()),
                namespace: Some(cluster.namespace()),
                labels: Some(cluster.labels()),
                annotations: Some(annotations),
                owner_references: Some(vec![owner_reference(cluster.object())]),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: endpoint.ingress_class_name.clone(),
                tls: (!endpoint.tls.is_empty()).then(|| endpoint.tls.clone()),
                rules: Some(vec![rule]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
