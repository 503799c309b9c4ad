//! Unit tests for action selection

use cockroach_operator::controller::director::{Observed, handles, pick};
use cockroach_operator::crd::{ActionType, ConditionType};
use cockroach_operator::features::{Feature, FeatureGates};
use cockroach_operator::resources::common::annotations;

use crate::common::{CrdbClusterBuilder, test_model, test_statefulset};

fn observed(replicas: Option<i32>, version: &str) -> Observed {
    Observed {
        service_account_exists: true,
        statefulset: replicas.map(|r| test_statefulset("crdb", r, version)),
        children_drifted: false,
    }
}

mod cold_start_tests {
    use super::*;

    #[test]
    fn test_insecure_cold_start_sequence() {
        let features = FeatureGates::default();
        let mut cluster = test_model(CrdbClusterBuilder::new("crdb", "db").build());
        let mut state = Observed::default();

        let mut picks = Vec::new();
        while let Some(action) = pick(&cluster, &features, &state) {
            picks.push(action);
            match action {
                ActionType::SetupRbac => state.service_account_exists = true,
                ActionType::VersionCheck => {
                    cluster.set_annotation(annotations::VERSION, "v24.1.0");
                    cluster.set_true(ConditionType::CrdbVersionChecked);
                }
                ActionType::Deploy => state.statefulset = Some(test_statefulset("crdb", 3, "v24.1.0")),
                ActionType::Initialize => cluster.set_true(ConditionType::Initialized),
                other => panic!("unexpected action {other}"),
            }
            assert!(picks.len() <= 4, "cold start did not converge: {picks:?}");
        }

        assert_eq!(
            picks,
            vec![
                ActionType::SetupRbac,
                ActionType::VersionCheck,
                ActionType::Deploy,
                ActionType::Initialize,
            ]
        );
    }

    #[test]
    fn test_secure_cold_start_generates_certs_before_deploy() {
        let features = FeatureGates::default();
        let mut cluster = test_model(CrdbClusterBuilder::new("crdb", "db").with_tls().build());
        cluster.set_true(ConditionType::CrdbVersionChecked);
        let state = observed(None, "v24.1.0");

        assert_eq!(pick(&cluster, &features, &state), Some(ActionType::GenerateCert));
        cluster.set_true(ConditionType::CertificateGenerated);
        assert_eq!(pick(&cluster, &features, &state), Some(ActionType::Deploy));
    }

    #[test]
    fn test_external_certificates_are_not_generated() {
        let mut object = CrdbClusterBuilder::new("crdb", "db").with_tls().build();
        object.spec.node_tls_secret = Some("my-node".into());
        object.spec.client_tls_secret = Some("my-root".into());
        let mut cluster = test_model(object);
        cluster.set_true(ConditionType::CrdbVersionChecked);

        let features = FeatureGates::default();
        assert!(!handles(ActionType::GenerateCert, &cluster, &features, &observed(None, "v24.1.0")));
    }

    #[test]
    fn test_version_gate_off_skips_version_check() {
        let features = FeatureGates::default().with(Feature::CrdbVersionValidator, false);
        let cluster = test_model(CrdbClusterBuilder::new("crdb", "db").build());
        assert_eq!(
            pick(&cluster, &features, &observed(None, "v24.1.0")),
            Some(ActionType::Deploy)
        );
    }
}

mod day_two_tests {
    use super::*;

    fn converged(nodes: i32) -> cockroach_operator::cluster::Cluster {
        let mut cluster = test_model(
            CrdbClusterBuilder::new("crdb", "db")
                .with_nodes(nodes)
                .with_checked_version("v24.1.0")
                .build(),
        );
        cluster.set_true(ConditionType::CrdbVersionChecked);
        cluster.set_true(ConditionType::Initialized);
        cluster
    }

    #[test]
    fn test_scale_down_below_current_decommissions() {
        let cluster = converged(3);
        assert_eq!(
            pick(&cluster, &FeatureGates::default(), &observed(Some(4), "v24.1.0")),
            Some(ActionType::Decommission)
        );
    }

    #[test]
    fn test_steady_three_nodes_picks_nothing() {
        let cluster = converged(3);
        assert_eq!(pick(&cluster, &FeatureGates::default(), &observed(Some(3), "v24.1.0")), None);
    }

    #[test]
    fn test_patch_upgrade_checks_version_then_updates() {
        let features = FeatureGates::default();
        let mut cluster = converged(3);
        cluster.set_false(ConditionType::CrdbVersionChecked);
        let state = observed(Some(3), "v24.1.0");
        assert_eq!(pick(&cluster, &features, &state), Some(ActionType::VersionCheck));

        cluster.set_annotation(annotations::VERSION, "v24.1.5");
        cluster.set_true(ConditionType::CrdbVersionChecked);
        assert_eq!(pick(&cluster, &features, &state), Some(ActionType::PartitionedUpdate));
    }

    #[test]
    fn test_restart_annotation_triggers_restart() {
        let mut cluster = converged(3);
        cluster.set_annotation(annotations::RESTART_TYPE, "Rolling");
        assert_eq!(
            pick(&cluster, &FeatureGates::default(), &observed(Some(3), "v24.1.0")),
            Some(ActionType::ClusterRestart)
        );
    }

    #[test]
    fn test_sql_ingress_host_change_reissues_certs() {
        let mut cluster = test_model(
            CrdbClusterBuilder::new("crdb", "db")
                .with_tls()
                .with_sql_ingress("sql.example.com")
                .with_checked_version("v24.1.0")
                .build(),
        );
        cluster.set_true(ConditionType::CrdbVersionChecked);
        cluster.set_true(ConditionType::Initialized);
        cluster.set_true(ConditionType::CertificateGenerated);
        cluster.set_true(ConditionType::SqlIngressExposed);
        cluster.status_mut().sql_host = Some("old.example.com".into());

        let features = FeatureGates::default();
        let state = observed(Some(3), "v24.1.0");
        assert_eq!(pick(&cluster, &features, &state), Some(ActionType::GenerateCert));

        cluster.status_mut().sql_host = Some("sql.example.com".into());
        assert_eq!(pick(&cluster, &features, &state), None);
    }

    #[test]
    fn test_ingress_toggle_exposes() {
        let mut cluster = test_model(
            CrdbClusterBuilder::new("crdb", "db")
                .with_ui_ingress("ui.example.com")
                .with_checked_version("v24.1.0")
                .build(),
        );
        cluster.set_true(ConditionType::CrdbVersionChecked);
        cluster.set_true(ConditionType::Initialized);
        assert_eq!(
            pick(&cluster, &FeatureGates::default(), &observed(Some(3), "v24.1.0")),
            Some(ActionType::ExposeIngress)
        );
    }

    #[test]
    fn test_larger_claim_resizes() {
        let mut cluster = test_model(
            CrdbClusterBuilder::new("crdb", "db")
                .with_storage("20Gi")
                .with_auto_resize()
                .with_checked_version("v24.1.0")
                .build(),
        );
        cluster.set_true(ConditionType::CrdbVersionChecked);
        cluster.set_true(ConditionType::Initialized);

        let mut sts = test_statefulset("crdb", 3, "v24.1.0");
        let template = &mut sts.spec.as_mut().unwrap().volume_claim_templates.as_mut().unwrap()[0];
        template.spec = cluster.spec().data_store.claim_template().cloned().map(|mut s| {
            s.resources.as_mut().unwrap().requests.as_mut().unwrap().insert(
                "storage".into(),
                k8s_openapi::apimachinery::pkg::api::resource::Quantity("10Gi".into()),
            );
            s
        });
        let state = Observed {
            service_account_exists: true,
            statefulset: Some(sts),
            children_drifted: false,
        };

        assert_eq!(pick(&cluster, &FeatureGates::default(), &state), Some(ActionType::ResizePvc));
        let gated = FeatureGates::default().with(Feature::ResizePvc, false);
        assert_eq!(pick(&cluster, &gated, &state), None);
    }
}
