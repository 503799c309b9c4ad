//! Unit tests for version transitions, partitioned updates and claim pruning

use chrono::{TimeZone, Utc};
use cockroach_operator::actor::partitioned_update::plan_update;
use cockroach_operator::resources::Builder;
use cockroach_operator::resources::common::annotations;
use cockroach_operator::resources::statefulset::{DB_CONTAINER_NAME, StatefulSetBuilder};
use cockroach_operator::scale::pvc_pruner::pvcs_to_delete;
use cockroach_operator::update::UpdateError;
use cockroach_operator::update::partitioned::{apply_image, set_partition};
use cockroach_operator::update::version::{
    UpdateKind, check_preserve_downgrade, classify, image_name_without_version,
    parse_preserve_downgrade, parse_version, target_image,
};
use kube::ResourceExt;

use crate::common::{CrdbClusterBuilder, test_model, test_pvc, test_statefulset};

mod version_tests {
    use super::*;

    fn kind(current: &str, want: &str) -> Result<UpdateKind, UpdateError> {
        classify(&parse_version(current).unwrap(), &parse_version(want).unwrap())
    }

    #[test]
    fn test_supported_transitions() {
        assert_eq!(kind("v24.1.0", "v24.1.5").unwrap(), UpdateKind::Patch);
        assert_eq!(kind("v23.1.11", "v23.2.0").unwrap(), UpdateKind::MajorUpgrade);
        assert_eq!(kind("v23.2.4", "v24.1.0").unwrap(), UpdateKind::MajorUpgrade);
        assert_eq!(kind("v23.2.0", "v23.1.11").unwrap(), UpdateKind::MajorRollback);
        assert_eq!(kind("v24.1.0", "v23.2.4").unwrap(), UpdateKind::MajorRollback);
    }

    #[test]
    fn test_skipping_a_major_is_rejected() {
        let err = kind("v22.2.0", "v24.1.0").unwrap_err();
        assert!(err.to_string().contains("only patches"));
    }

    #[test]
    fn test_stale_preserve_blocks_upgrade() {
        let current = parse_version("v23.2.0").unwrap();
        let want = parse_version("v24.1.0").unwrap();
        let preserve = parse_preserve_downgrade("22.2").unwrap();
        let err = check_preserve_downgrade(UpdateKind::MajorUpgrade, &current, &want, preserve)
            .unwrap_err();
        assert!(err.to_string().contains("preserve downgrade option"));
    }

    #[test]
    fn test_rollback_needs_preserve() {
        let current = parse_version("v24.1.0").unwrap();
        let want = parse_version("v23.2.0").unwrap();
        assert!(check_preserve_downgrade(UpdateKind::MajorRollback, &current, &want, None).is_err());
        let preserve = parse_preserve_downgrade("23.2").unwrap();
        assert!(check_preserve_downgrade(UpdateKind::MajorRollback, &current, &want, preserve).is_ok());
    }

    #[test]
    fn test_plan_sets_preserve_before_major_upgrade() {
        let plan = plan_update("v23.2.0", "v24.1.0", "").unwrap();
        assert_eq!(plan.kind, UpdateKind::MajorUpgrade);
        assert_eq!(plan.set_preserve_downgrade.as_deref(), Some("23.2"));

        let patch = plan_update("v24.1.0", "v24.1.5", "").unwrap();
        assert_eq!(patch.kind, UpdateKind::Patch);
        assert_eq!(patch.set_preserve_downgrade, None);
    }

    #[test]
    fn test_image_names() {
        assert_eq!(image_name_without_version("cockroachdb/cockroach:v24.1.0"), "cockroachdb/cockroach");
        assert_eq!(
            image_name_without_version("registry:5000/cockroach:v24.1.0"),
            "registry:5000/cockroach"
        );
        assert_eq!(target_image("cockroachdb/cockroach", "v24.1.5"), "cockroachdb/cockroach:v24.1.5");
    }
}

mod partitioned_tests {
    use super::*;

    #[test]
    fn test_apply_image_records_history() {
        let cluster = test_model(CrdbClusterBuilder::new("crdb", "db").with_checked_version("v24.1.0").build());
        let mut sts = StatefulSetBuilder {
            cluster: &cluster,
            image: "cockroachdb/cockroach:v24.1.0".into(),
            replicas: 3,
            database_env: &[],
        }
        .build()
        .unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        apply_image(&mut sts, "cockroachdb/cockroach:v24.1.5", "v24.1.5", now).unwrap();
        apply_image(&mut sts, "cockroachdb/cockroach:v24.1.5", "v24.1.5", now).unwrap();

        let container = &sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, DB_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("cockroachdb/cockroach:v24.1.5"));
        assert_eq!(
            sts.annotations().get(annotations::HISTORY).map(String::as_str),
            Some("2024-06-01T00:00:00+00:00=v24.1.0")
        );
        assert_eq!(sts.annotations().get(annotations::VERSION).map(String::as_str), Some("v24.1.5"));
    }

    #[test]
    fn test_set_partition() {
        let mut sts = test_statefulset("crdb", 3, "v24.1.0");
        set_partition(&mut sts, 2);
        let strategy = sts.spec.unwrap().update_strategy.unwrap();
        assert_eq!(strategy.rolling_update.unwrap().partition, Some(2));
    }
}

mod pvc_prune_tests {
    use super::*;

    #[test]
    fn test_leftover_claims_are_selected() {
        let sts = test_statefulset("crdb", 3, "v24.1.0");
        let pvcs = vec![
            test_pvc("datadir-crdb-4"),
            test_pvc("datadir-crdb-0"),
            test_pvc("datadir-crdb-3"),
            test_pvc("datadir-crdb-2"),
            test_pvc("datadir-other-5"),
            test_pvc("logs-crdb-7"),
        ];
        let names: Vec<String> = pvcs_to_delete(&sts, pvcs).iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["datadir-crdb-3", "datadir-crdb-4"]);
    }

    #[test]
    fn test_nothing_to_prune_at_steady_state() {
        let sts = test_statefulset("crdb", 3, "v24.1.0");
        let pvcs = (0..3).map(|i| test_pvc(&format!("datadir-crdb-{i}"))).collect();
        assert!(pvcs_to_delete(&sts, pvcs).is_empty());
    }
}
