//! Validation of the CrdbCluster spec
//!
//! Runs before any action. A spec that fails here is recorded against the
//! picked action as failed, and nothing runs until the user edits it.

use crate::controller::error::{Error, Result};
use crate::crd::CrdbClusterSpec;

/// Smallest cluster the operator manages
pub const MIN_NODES: i32 = 3;

/// Validate the cluster spec
pub fn validate_spec(spec: &CrdbClusterSpec) -> Result<()> {
    validate_nodes(spec)?;
    validate_data_store(spec)?;
    validate_tls(spec)?;
    validate_disruption_budget(spec)?;
    validate_ingress(spec)?;
    Ok(())
}

fn validate_nodes(spec: &CrdbClusterSpec) -> Result<()> {
    if spec.nodes < MIN_NODES {
        return Err(Error::ValidationError(format!(
            "nodes {} is below minimum of {MIN_NODES}",
            spec.nodes
        )));
    }
    Ok(())
}

/// Exactly one of hostPath, a claim template or a claim source
fn validate_data_store(spec: &CrdbClusterSpec) -> Result<()> {
    let store = &spec.data_store;
    match store.configured_kinds() {
        1 => {}
        0 => {
            return Err(Error::ValidationError(
                "dataStore must set one of hostPath, pvc.spec or pvc.source".to_string(),
            ));
        }
        _ => {
            return Err(Error::ValidationError(
                "dataStore sets more than one of hostPath, pvc.spec and pvc.source".to_string(),
            ));
        }
    }
    if store.supports_auto_resize && store.claim_template().is_none() {
        return Err(Error::ValidationError(
            "supportsAutoResize requires dataStore.pvc.spec".to_string(),
        ));
    }
    Ok(())
}

/// External certificates come in pairs and only make sense with TLS on
fn validate_tls(spec: &CrdbClusterSpec) -> Result<()> {
    let set = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.is_empty());
    let node = set(&spec.node_tls_secret);
    let client = set(&spec.client_tls_secret);
    if node != client {
        return Err(Error::ValidationError(
            "nodeTLSSecret and clientTLSSecret must be set together".to_string(),
        ));
    }
    if node && !spec.tls_enabled {
        return Err(Error::ValidationError(
            "nodeTLSSecret and clientTLSSecret require tlsEnabled".to_string(),
        ));
    }
    Ok(())
}

fn validate_disruption_budget(spec: &CrdbClusterSpec) -> Result<()> {
    if spec.max_unavailable.is_some() && spec.min_available.is_some() {
        return Err(Error::ValidationError(
            "maxUnavailable and minAvailable are mutually exclusive".to_string(),
        ));
    }
    Ok(())
}

fn validate_ingress(spec: &CrdbClusterSpec) -> Result<()> {
    let Some(ingress) = spec.ingress.as_ref() else {
        return Ok(());
    };
    for (kind, endpoint) in [("ui", &ingress.ui), ("sql", &ingress.sql)] {
        if endpoint.as_ref().is_some_and(|e| e.host.is_empty()) {
            return Err(Error::ValidationError(format!("ingress.{kind}.host must be set")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{IngressConfig, IngressEndpoint, Volume, VolumeClaim};
    use k8s_openapi::api::core::v1::{HostPathVolumeSource, PersistentVolumeClaimSpec};

    fn spec() -> CrdbClusterSpec {
        CrdbClusterSpec {
            nodes: 3,
            data_store: Volume {
                pvc: Some(VolumeClaim {
                    spec: Some(PersistentVolumeClaimSpec::default()),
                    source: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn message(spec: &CrdbClusterSpec) -> String {
        validate_spec(spec).unwrap_err().to_string()
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate_spec(&spec()).is_ok());
    }

    #[test]
    fn test_below_minimum() {
        let spec = CrdbClusterSpec { nodes: 2, ..spec() };
        assert!(message(&spec).contains("below minimum"));
    }

    #[test]
    fn test_data_store_needs_exactly_one_kind() {
        let mut none = spec();
        none.data_store = Volume::default();
        assert!(message(&none).contains("must set one of"));

        let mut both = spec();
        both.data_store.host_path = Some(HostPathVolumeSource {
            path: "/mnt/crdb".into(),
            ..Default::default()
        });
        assert!(message(&both).contains("more than one"));
    }

    #[test]
    fn test_auto_resize_needs_claim_template() {
        let mut spec = spec();
        spec.data_store = Volume {
            host_path: Some(HostPathVolumeSource {
                path: "/mnt/crdb".into(),
                ..Default::default()
            }),
            supports_auto_resize: true,
            ..Default::default()
        };
        assert!(message(&spec).contains("supportsAutoResize"));
    }

    #[test]
    fn test_tls_secrets() {
        let mut spec = spec();
        spec.tls_enabled = true;
        spec.node_tls_secret = Some("crdb-node".into());
        assert!(message(&spec).contains("set together"));

        spec.client_tls_secret = Some("crdb-root".into());
        assert!(validate_spec(&spec).is_ok());

        spec.tls_enabled = false;
        assert!(message(&spec).contains("require tlsEnabled"));
    }

    #[test]
    fn test_budget_fields_are_exclusive() {
        let spec = CrdbClusterSpec {
            max_unavailable: Some(1),
            min_available: Some(2),
            ..spec()
        };
        assert!(message(&spec).contains("mutually exclusive"));
    }

    #[test]
    fn test_ingress_needs_host() {
        let spec = CrdbClusterSpec {
            ingress: Some(IngressConfig {
                ui: Some(IngressEndpoint::default()),
                sql: None,
            }),
            ..spec()
        };
        assert_eq!(message(&spec), "Validation error: ingress.ui.host must be set");
    }
}
