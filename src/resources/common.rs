//! Common utilities for Kubernetes resource generation
//!
//! Shared labels, annotation keys and owner references used by every
//! builder, so that all children of a cluster are recognisable as ours.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::CrdbCluster;

/// Operator field manager name
pub const FIELD_MANAGER: &str = "cockroach-operator";

/// Annotation keys owned by the controller
pub mod annotations {
    pub const VERSION: &str = "crdb.cockroachlabs.com/version";
    pub const CONTAINER_IMAGE: &str = "crdb.cockroachlabs.com/containerImage";
    pub const CERT_EXPIRATION: &str = "crdb.cockroachlabs.com/certExpiration";
    pub const RESTART_TYPE: &str = "crdb.cockroachlabs.com/restartType";
    pub const RESTARTED_AT: &str = "crdb.cockroachlabs.com/restartedAt";
    /// Version history kept on the stateful set
    pub const HISTORY: &str = "crdb.cockroachlabs.com/history";
    /// Hash of the last spec written by the annotating persister
    pub const LAST_APPLIED_HASH: &str = "crdb.cockroachlabs.com/last-applied-hash";
    /// Preserved during the v1alpha1 to v1beta1 migration; not read by the controller
    pub const CLOUD_PROVIDER: &str = "crdb.cockroachlabs.com/cloudProvider";
    pub const REGION_CODE: &str = "crdb.cockroachlabs.com/regionCode";
}

/// Label keys
pub mod labels {
    pub const NAME: &str = "app.kubernetes.io/name";
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    pub const COMPONENT: &str = "app.kubernetes.io/component";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Label on version-check job pods
    pub const JOB_NAME: &str = "job-name";
}

pub const APP_NAME: &str = "cockroachdb";
pub const COMPONENT_DATABASE: &str = "database";

/// Generate an owner reference pointing at the cluster
///
/// All child resources carry this so they are garbage collected when the
/// cluster is deleted.
pub fn owner_reference(cluster: &CrdbCluster) -> OwnerReference {
    OwnerReference {
        api_version: CrdbCluster::api_version(&()).to_string(),
        kind: CrdbCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels used to select the database pods of a cluster
pub fn selector_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::NAME.to_string(), APP_NAME.to_string()),
        (labels::INSTANCE.to_string(), cluster_name.to_string()),
        (
            labels::COMPONENT.to_string(),
            COMPONENT_DATABASE.to_string(),
        ),
    ])
}

/// Base labels for every resource belonging to a cluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster_name);
    labels.insert(labels::MANAGED_BY.to_string(), FIELD_MANAGER.to_string());
    labels
}

/// Standard labels merged with `additionalLabels`. User labels cannot
/// override the selector labels.
pub fn cluster_labels(cluster: &CrdbCluster) -> BTreeMap<String, String> {
    let name = cluster.name_any();
    let selector = selector_labels(&name);
    let mut labels = standard_labels(&name);

    for (key, value) in &cluster.spec.additional_labels {
        if !selector.contains_key(key) {
            labels.insert(key.clone(), value.clone());
        }
    }

    labels
}

/// Render a label map as a selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a Kubernetes quantity (`10Gi`, `500M`, `250m`, `1e3`) into its value
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }

    const SUFFIXES: [(&str, f64); 13] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
        ("m", 0.001),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = q.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * multiplier);
        }
    }

    q.parse::<f64>().ok()
}

/// Storage request of a volume claim spec
pub fn storage_request(spec: &PersistentVolumeClaimSpec) -> Option<&Quantity> {
    spec.resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
}
