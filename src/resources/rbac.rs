//! Service account, role and role binding for database pods
//!
//! Database pods only need to read secrets; the `anyuid` security context
//! constraint rule lets them run as uid 10001 on OpenShift.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::core::ObjectMeta;

use crate::cluster::Cluster;
use crate::resources::common::owner_reference;
use crate::resources::reconcile::{Builder, ResourceError};

fn metadata(cluster: &Cluster, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(cluster.namespace()),
        labels: Some(cluster.labels()),
        owner_references: Some(vec![owner_reference(cluster.object())]),
        ..Default::default()
    }
}

pub struct ServiceAccountBuilder<'a> {
    pub cluster: &'a Cluster,
}

impl Builder for ServiceAccountBuilder<'_> {
    type Object = ServiceAccount;

    fn resource_name(&self) -> String {
        self.cluster.service_account_name()
    }

    fn build(&self) -> Result<ServiceAccount, ResourceError> {
        Ok(ServiceAccount {
            metadata: metadata(self.cluster, self.resource_name()),
            ..Default::default()
        })
    }
}

pub struct RoleBuilder<'a> {
    pub cluster: &'a Cluster,
}

impl Builder for RoleBuilder<'_> {
    type Object = Role;

    fn resource_name(&self) -> String {
        self.cluster.role_name()
    }

    fn build(&self) -> Result<Role, ResourceError> {
        Ok(Role {
            metadata: metadata(self.cluster, self.resource_name()),
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec!["".to_string()]),
                    resources: Some(vec!["secrets".to_string()]),
                    verbs: vec!["get".to_string()],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["security.openshift.io".to_string()]),
                    resources: Some(vec!["securitycontextconstraints".to_string()]),
                    resource_names: Some(vec!["anyuid".to_string()]),
                    verbs: vec!["use".to_string()],
                    ..Default::default()
                },
            ]),
        })
    }
}

pub struct RoleBindingBuilder<'a> {
    pub cluster: &'a Cluster,
}

impl Builder for RoleBindingBuilder<'_> {
    type Object = RoleBinding;

    fn resource_name(&self) -> String {
        self.cluster.role_binding_name()
    }

    fn build(&self) -> Result<RoleBinding, ResourceError> {
        let cluster = self.cluster;
        Ok(RoleBinding {
            metadata: metadata(cluster, self.resource_name()),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: cluster.role_name(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: cluster.service_account_name(),
                namespace: Some(cluster.namespace()),
                ..Default::default()
            }]),
        })
    }
}
