//! Unit tests for spec validation

use cockroach_operator::controller::validation::{MIN_NODES, validate_spec};
use cockroach_operator::crd::{CrdbClusterSpec, Volume};

use crate::common::CrdbClusterBuilder;

fn spec(builder: CrdbClusterBuilder) -> CrdbClusterSpec {
    builder.build().spec
}

#[test]
fn test_min_nodes_constant() {
    assert_eq!(MIN_NODES, 3);
}

#[test]
fn test_default_fixture_is_valid() {
    assert!(validate_spec(&spec(CrdbClusterBuilder::new("crdb", "db"))).is_ok());
}

#[test]
fn test_two_nodes_rejected() {
    let spec = spec(CrdbClusterBuilder::new("crdb", "db").with_nodes(2));
    let err = validate_spec(&spec).unwrap_err();
    assert!(err.to_string().contains("below minimum of 3"));
    assert!(!err.is_retryable());
}

#[test]
fn test_host_path_store_is_valid() {
    let spec = spec(CrdbClusterBuilder::new("crdb", "db").with_host_path("/mnt/disks/crdb"));
    assert!(validate_spec(&spec).is_ok());
}

#[test]
fn test_missing_store_rejected() {
    let mut spec = spec(CrdbClusterBuilder::new("crdb", "db"));
    spec.data_store = Volume::default();
    assert!(validate_spec(&spec).is_err());
}

#[test]
fn test_auto_resize_with_host_path_rejected() {
    let mut spec = spec(CrdbClusterBuilder::new("crdb", "db").with_host_path("/mnt/disks/crdb"));
    spec.data_store.supports_auto_resize = true;
    assert!(validate_spec(&spec).unwrap_err().to_string().contains("supportsAutoResize"));
}

#[test]
fn test_disruption_budget_exclusive() {
    let spec = spec(
        CrdbClusterBuilder::new("crdb", "db")
            .with_min_available(2)
            .with_max_unavailable(1),
    );
    assert!(validate_spec(&spec).is_err());
}

#[test]
fn test_external_tls_needs_both_secrets() {
    let mut spec = spec(CrdbClusterBuilder::new("crdb", "db").with_tls());
    spec.client_tls_secret = Some("crdb-root".into());
    assert!(validate_spec(&spec).is_err());
    spec.node_tls_secret = Some("crdb-node".into());
    assert!(validate_spec(&spec).is_ok());
}

#[test]
fn test_empty_ingress_host_rejected() {
    let spec = spec(CrdbClusterBuilder::new("crdb", "db").with_sql_ingress(""));
    assert!(validate_spec(&spec).unwrap_err().to_string().contains("ingress.sql.host"));
}
