//! PodDisruptionBudget generation for CockroachDB clusters
//!
//! Only built when the cluster has more than one node. The budget follows
//! `maxUnavailable` or `minAvailable` from the spec. `maxUnavailable`
//! defaults to 1 unless `minAvailable` was given.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::cluster::Cluster;
use crate::resources::common::owner_reference;
use crate::resources::reconcile::{Builder, ResourceError};

pub struct PdbBuilder<'a> {
    pub cluster: &'a Cluster,
}

impl PdbBuilder<'_> {
    /// Single-node clusters get no budget
    pub fn is_needed(&self) -> bool {
        self.cluster.nodes() > 1
    }
}

impl Builder for PdbBuilder<'_> {
    type Object = PodDisruptionBudget;

    fn resource_name(&self) -> String {
        self.cluster.pdb_name()
    }

    fn build(&self) -> Result<PodDisruptionBudget, ResourceError> {
        let cluster = self.cluster;
        let spec = cluster.spec();

        let (max_unavailable, min_available) = match (spec.max_unavailable, spec.min_available) {
            (_, Some(min)) => (None, Some(IntOrString::Int(min))),
            (Some(max), None) => (Some(IntOrString::Int(max)), None),
            (None, None) => (Some(IntOrString::Int(1)), None),
        };

        Ok(PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some(self.resource_name()),
                namespace: Some(cluster.namespace()),
                labels: Some(cluster.labels()),
                owner_references: Some(vec![owner_reference(cluster.object())]),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                max_unavailable,
                min_available,
                selector: Some(LabelSelector {
                    match_labels: Some(cluster.selector()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
