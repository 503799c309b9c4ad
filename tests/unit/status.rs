//! Unit tests for the condition and action ledger

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use cockroach_operator::actor::ActorError;
use cockroach_operator::controller::reconciler::{Outcome, prepare, record_outcome};
use cockroach_operator::controller::status::apply_annotation_changes;
use cockroach_operator::crd::{
    ActionStatus, ActionType, ConditionStatus, ConditionType, CrdbClusterStatus,
};
use cockroach_operator::resources::common::annotations;

use crate::common::{CrdbClusterBuilder, create_test_cluster, test_model};

mod condition_tests {
    use super::*;

    #[test]
    fn test_init_conditions_seeds_false() {
        let mut status = CrdbClusterStatus::default();
        status.init_conditions(Utc::now());
        assert!(status.is_false(ConditionType::Initialized));
        assert!(status.is_false(ConditionType::CrdbVersionChecked));
        assert!(!status.has(ConditionType::CertificateGenerated));
    }

    #[test]
    fn test_transition_time_moves_only_on_change() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 5, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 10, 0).unwrap();

        let mut status = CrdbClusterStatus::default();
        status.set_condition(ConditionType::Initialized, ConditionStatus::False, t0);
        status.set_condition(ConditionType::Initialized, ConditionStatus::False, t1);
        assert_eq!(
            status.condition(ConditionType::Initialized).unwrap().last_transition_time,
            t0.to_rfc3339()
        );

        status.set_condition(ConditionType::Initialized, ConditionStatus::True, t2);
        let condition = status.condition(ConditionType::Initialized).unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.last_transition_time, t2.to_rfc3339());
    }

    #[test]
    fn test_init_keeps_existing_conditions() {
        let mut status = CrdbClusterStatus::default();
        status.set_condition(ConditionType::Initialized, ConditionStatus::True, Utc::now());
        status.init_conditions(Utc::now());
        assert!(status.is_true(ConditionType::Initialized));
        assert_eq!(status.conditions.len(), 2);
    }
}

mod action_ledger_tests {
    use super::*;

    #[test]
    fn test_one_entry_per_action() {
        let mut status = CrdbClusterStatus::default();
        let now = Utc::now();
        status.set_action(ActionType::Deploy, ActionStatus::Starting, None, now);
        status.set_action(ActionType::Deploy, ActionStatus::Finished, None, now);
        status.set_action(ActionType::Initialize, ActionStatus::Starting, None, now);
        assert_eq!(status.operator_actions.len(), 2);
        assert_eq!(status.action(ActionType::Deploy).unwrap().status, ActionStatus::Finished);
    }

    #[test]
    fn test_aggregate_failed_wins() {
        let mut status = CrdbClusterStatus::default();
        let now = Utc::now();
        status.set_action(ActionType::Deploy, ActionStatus::Finished, None, now);
        status.set_action(ActionType::Initialize, ActionStatus::Unknown, None, now);
        status.aggregate_cluster_status();
        assert_eq!(status.cluster_status.as_deref(), Some("Unknown"));

        status.set_action(ActionType::Decommission, ActionStatus::Failed, Some("stalled".into()), now);
        status.aggregate_cluster_status();
        assert_eq!(status.cluster_status.as_deref(), Some("Failed"));
    }

    #[test]
    fn test_aggregate_all_finished() {
        let mut status = CrdbClusterStatus::default();
        let now = Utc::now();
        for action in [ActionType::SetupRbac, ActionType::VersionCheck, ActionType::Deploy] {
            status.set_action(action, ActionStatus::Finished, None, now);
        }
        status.aggregate_cluster_status();
        assert_eq!(status.cluster_status.as_deref(), Some("Finished"));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let mut status = CrdbClusterStatus::default();
        status.init_conditions(Utc::now());
        status.set_action(ActionType::SetupRbac, ActionStatus::Finished, None, Utc::now());
        status.cluster_status = Some("Finished".into());

        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("operatorActions").is_some());
        assert_eq!(json["clusterStatus"], "Finished");
        assert_eq!(json["operatorActions"][0]["type"], "SetupRBAC");
    }
}

mod reconcile_outcome_tests {
    use super::*;

    #[test]
    fn test_prepare_starts_cluster() {
        let mut cluster = test_model(create_test_cluster("crdb", "db", 3));
        cluster.status_mut().cluster_status = None;
        prepare(&mut cluster);
        assert_eq!(cluster.status().cluster_status.as_deref(), Some("Starting"));
    }

    #[test]
    fn test_stalled_decommission_fails_cluster() {
        let mut cluster = test_model(create_test_cluster("crdb", "db", 3));
        let outcome = record_outcome(
            &mut cluster,
            ActionType::Decommission,
            &Err(ActorError::permanent("decommission stalled on node 5")),
        );
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(cluster.status().cluster_status.as_deref(), Some("Failed"));
    }

    #[test]
    fn test_transient_failure_keeps_action_starting() {
        let mut cluster = test_model(create_test_cluster("crdb", "db", 3));
        let outcome = record_outcome(
            &mut cluster,
            ActionType::Deploy,
            &Err(ActorError::transient("conflict")),
        );
        assert_eq!(outcome, Outcome::Retry);
        let entry = cluster.status().action(ActionType::Deploy).unwrap();
        assert_eq!(entry.status, ActionStatus::Starting);
        assert_eq!(entry.message.as_deref(), Some("conflict"));
    }
}

mod annotation_tests {
    use super::*;

    #[test]
    fn test_changes_add_and_remove() {
        let mut object = CrdbClusterBuilder::new("crdb", "db")
            .with_annotation(annotations::RESTART_TYPE, "Rolling")
            .with_annotation("team", "storage")
            .build();
        let changes = BTreeMap::from([
            (annotations::RESTART_TYPE.to_string(), None),
            (annotations::VERSION.to_string(), Some("v24.1.0".to_string())),
        ]);
        apply_annotation_changes(&mut object, &changes);

        let annotations_map = object.metadata.annotations.unwrap();
        assert!(!annotations_map.contains_key(annotations::RESTART_TYPE));
        assert_eq!(annotations_map.get(annotations::VERSION).map(String::as_str), Some("v24.1.0"));
        assert_eq!(annotations_map.get("team").map(String::as_str), Some("storage"));
    }
}
