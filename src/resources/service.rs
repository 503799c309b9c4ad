//! Service generation for CockroachDB clusters
//!
//! Two services front every cluster:
//! - the headless discovery service `<cluster>`, which gives each pod a
//!   stable DNS name and is used by `--join`;
//! - the public service `<cluster>-public`, a ClusterIP service clients and
//!   ingresses connect through.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::cluster::Cluster;
use crate::resources::common::owner_reference;
use crate::resources::reconcile::{Builder, ResourceError};

pub const GRPC_PORT_NAME: &str = "grpc";
pub const HTTP_PORT_NAME: &str = "http";
pub const SQL_PORT_NAME: &str = "sql";

fn service_ports(cluster: &Cluster) -> Vec<ServicePort> {
    [
        (GRPC_PORT_NAME, cluster.grpc_port()),
        (HTTP_PORT_NAME, cluster.http_port()),
        (SQL_PORT_NAME, cluster.sql_port()),
    ]
    .into_iter()
    .map(|(name, port)| ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    })
    .collect()
}

/// Headless service used for peer discovery
pub struct DiscoveryServiceBuilder<'a> {
    pub cluster: &'a Cluster,
}

impl Builder for DiscoveryServiceBuilder<'_> {
    type Object = Service;

    fn resource_name(&self) -> String {
        self.cluster.discovery_service_name()
    }

    fn build(&self) -> Result<Service, ResourceError> {
        let cluster = self.cluster;
        // Prometheus scrapes every node through the discovery service
        let annotations = BTreeMap::from([
            ("prometheus.io/scrape".to_string(), "true".to_string()),
            (
                "prometheus.io/path".to_string(),
                "_status/vars".to_string(),
            ),
            (
                "prometheus.io/port".to_string(),
                cluster.http_port().to_string(),
            ),
        ]);

        Ok(Service {
            metadata: ObjectMeta {
                name: Some(self.resource_name()),
                namespace: Some(cluster.namespace()),
                labels: Some(cluster.labels()),
                annotations: Some(annotations),
                owner_references: Some(vec![owner_reference(cluster.object())]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                publish_not_ready_addresses: Some(true),
                selector: Some(cluster.selector()),
                ports: Some(service_ports(cluster)),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

/// Client-facing service
pub struct PublicServiceBuilder<'a> {
    pub cluster: &'a Cluster,
}

impl Builder for PublicServiceBuilder<'_> {
    type Object = Service;

    fn resource_name(&self) -> String {
        self.cluster.public_service_name()
    }

    fn build(&self) -> Result<Service, ResourceError> {
        let cluster = self.cluster;
        Ok(Service {
            metadata: ObjectMeta {
                name: Some(self.resource_name()),
                namespace: Some(cluster.namespace()),
                labels: Some(cluster.labels()),
                owner_references: Some(vec![owner_reference(cluster.object())]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(cluster.selector()),
                ports: Some(service_ports(cluster)),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CrdbCluster, CrdbClusterSpec};

    fn cluster() -> Cluster {
        let mut object = CrdbCluster::new(
            "crdb",
            CrdbClusterSpec {
                nodes: 3,
                sql_port: Some(5432),
                ..Default::default()
            },
        );
        object.metadata.namespace = Some("db".into());
        object.metadata.uid = Some("uid".into());
        Cluster::new(object)
    }

    #[test]
    fn test_discovery_service_is_headless() {
        let c = cluster();
        let svc = DiscoveryServiceBuilder { cluster: &c }.build().unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(svc.metadata.name.as_deref(), Some("crdb"));
        let ports: Vec<i32> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![26258, 8080, 5432]);
        assert_eq!(svc.metadata.owner_references.unwrap()[0].name, "crdb");
    }

    #[test]
    fn test_public_service() {
        let c = cluster();
        let svc = PublicServiceBuilder { cluster: &c }.build().unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("crdb-public"));
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("ClusterIP"));
    }
}
