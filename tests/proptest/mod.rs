// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for defaults, action selection and version handling
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Applying defaults is idempotent
//! 2. The director is deterministic and its pick is the first matching action
//! 3. Claim pruning never selects an ordinal the stateful set still runs
//! 4. The preserve-downgrade format is exactly `NN.N`
//! 5. A one-step upgrade is always the mirror of a one-step rollback

#[path = "../common/mod.rs"]
mod common;

use proptest::prelude::*;

use cockroach_operator::controller::director::{Observed, handles, pick};
use cockroach_operator::crd::{ActionType, ConditionType, CrdbClusterSpec};
use cockroach_operator::features::{Feature, FeatureGates};
use cockroach_operator::resources::common::annotations;
use cockroach_operator::scale::pvc_pruner::pvcs_to_delete;
use cockroach_operator::update::version::{
    UpdateKind, classify, is_valid_preserve_downgrade_option, parse_version,
};
use kube::ResourceExt;
use semver::Version;

use common::{CrdbClusterBuilder, test_model, test_pvc, test_statefulset};

// =============================================================================
// Strategies
// =============================================================================

fn arb_spec() -> impl Strategy<Value = CrdbClusterSpec> {
    (
        1..10i32,
        proptest::option::of(1..65535i32),
        proptest::option::of(1..65535i32),
        proptest::option::of(0..5i32),
        proptest::option::of(0..5i32),
        proptest::option::of(prop_oneof![Just(String::new()), Just("25%".to_string()), Just("2Gi".to_string())]),
        proptest::option::of(0..600i64),
    )
        .prop_map(|(nodes, grpc, sql, max_unavailable, min_available, cache, grace)| CrdbClusterSpec {
            nodes,
            grpc_port: grpc,
            sql_port: sql,
            max_unavailable,
            min_available,
            cache,
            termination_grace_period_secs: grace,
            ..Default::default()
        })
}

fn arb_condition() -> impl Strategy<Value = Option<bool>> {
    prop_oneof![Just(None), Just(Some(true)), Just(Some(false))]
}

fn arb_features() -> impl Strategy<Value = FeatureGates> {
    proptest::collection::vec(any::<bool>(), Feature::ALL.len()).prop_map(|flags| {
        Feature::ALL
            .into_iter()
            .zip(flags)
            .fold(FeatureGates::default(), |gates, (f, on)| gates.with(f, on))
    })
}

#[derive(Debug, Clone)]
struct Scenario {
    nodes: i32,
    tls: bool,
    restart: bool,
    initialized: Option<bool>,
    version_checked: Option<bool>,
    certs: Option<bool>,
    sts_replicas: Option<i32>,
    sts_version: bool,
    service_account: bool,
    drifted: bool,
}

fn arb_scenario() -> impl Strategy<Value = Scenario> {
    (
        (3..7i32, any::<bool>(), any::<bool>()),
        (arb_condition(), arb_condition(), arb_condition()),
        (proptest::option::of(1..8i32), any::<bool>(), any::<bool>(), any::<bool>()),
    )
        .prop_map(
            |(
                (nodes, tls, restart),
                (initialized, version_checked, certs),
                (sts_replicas, sts_version, service_account, drifted),
            )| Scenario {
                nodes,
                tls,
                restart,
                initialized,
                version_checked,
                certs,
                sts_replicas,
                sts_version,
                service_account,
                drifted,
            },
        )
}

fn build(scenario: &Scenario) -> (cockroach_operator::cluster::Cluster, Observed) {
    let mut builder = CrdbClusterBuilder::new("crdb", "db")
        .with_nodes(scenario.nodes)
        .with_checked_version("v24.1.0");
    if scenario.tls {
        builder = builder.with_tls();
    }
    if scenario.restart {
        builder = builder.with_annotation(annotations::RESTART_TYPE, "Rolling");
    }

    let mut cluster = test_model(builder.build());
    let status = cluster.status_mut();
    status.conditions.clear();
    for (condition, value) in [
        (ConditionType::Initialized, scenario.initialized),
        (ConditionType::CrdbVersionChecked, scenario.version_checked),
        (ConditionType::CertificateGenerated, scenario.certs),
    ] {
        match value {
            Some(true) => cluster.set_true(condition),
            Some(false) => cluster.set_false(condition),
            None => {}
        }
    }

    let version = if scenario.sts_version { "v24.1.0" } else { "v23.2.0" };
    let observed = Observed {
        service_account_exists: scenario.service_account,
        statefulset: scenario.sts_replicas.map(|r| test_statefulset("crdb", r, version)),
        children_drifted: scenario.drifted,
    };
    (cluster, observed)
}

// =============================================================================
// Defaults
// =============================================================================

proptest! {
    #[test]
    fn defaults_are_idempotent(spec in arb_spec()) {
        let once = spec.with_defaults();
        let twice = once.with_defaults();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn defaults_set_a_disruption_budget(spec in arb_spec()) {
        let defaulted = spec.with_defaults();
        prop_assert!(defaulted.max_unavailable.is_some() || defaulted.min_available.is_some());
        prop_assert!(defaulted.cache.as_deref().is_some_and(|c| !c.is_empty()));
    }
}

// =============================================================================
// Director
// =============================================================================

proptest! {
    #[test]
    fn director_is_deterministic(scenario in arb_scenario(), features in arb_features()) {
        let (cluster, observed) = build(&scenario);
        prop_assert_eq!(
            pick(&cluster, &features, &observed),
            pick(&cluster, &features, &observed)
        );
    }

    #[test]
    fn director_picks_highest_priority_match(scenario in arb_scenario(), features in arb_features()) {
        let (cluster, observed) = build(&scenario);
        let picked = pick(&cluster, &features, &observed);
        let matching: Vec<ActionType> = ActionType::ALL
            .into_iter()
            .filter(|a| handles(*a, &cluster, &features, &observed))
            .collect();
        prop_assert_eq!(picked, matching.first().copied());
    }

    #[test]
    fn gated_actions_are_never_picked(scenario in arb_scenario()) {
        let (cluster, observed) = build(&scenario);
        let features = Feature::ALL
            .into_iter()
            .fold(FeatureGates::default(), |gates, f| gates.with(f, false));
        let picked = pick(&cluster, &features, &observed);
        prop_assert!(!matches!(
            picked,
            Some(ActionType::ClusterRestart
                | ActionType::Decommission
                | ActionType::VersionCheck
                | ActionType::ResizePvc
                | ActionType::Deploy)
        ));
    }
}

// =============================================================================
// Claim pruning
// =============================================================================

proptest! {
    #[test]
    fn pruning_never_selects_running_ordinals(
        replicas in 0..10i32,
        ordinals in proptest::collection::btree_set(0..20i32, 0..15),
    ) {
        let sts = test_statefulset("crdb", replicas, "v24.1.0");
        let pvcs = ordinals.iter().map(|i| test_pvc(&format!("datadir-crdb-{i}"))).collect();
        let selected = pvcs_to_delete(&sts, pvcs);

        let expected = ordinals.iter().filter(|i| **i >= replicas).count();
        prop_assert_eq!(selected.len(), expected);
        for pvc in &selected {
            let ordinal: i32 = pvc.name_any().rsplit('-').next().unwrap().parse().unwrap();
            prop_assert!(ordinal >= replicas);
        }
    }
}

// =============================================================================
// Versions
// =============================================================================

proptest! {
    #[test]
    fn preserve_option_accepts_two_digit_years(year in 10..100u32, release in 0..10u32) {
        let value = format!("{year}.{release}");
        prop_assert!(is_valid_preserve_downgrade_option(&value));
    }

    #[test]
    fn preserve_option_rejects_other_shapes(value in "[0-9.a-z]{0,8}") {
        let bytes = value.as_bytes();
        let well_formed = bytes.len() == 4
            && bytes[0].is_ascii_digit()
            && bytes[1].is_ascii_digit()
            && bytes[2] == b'.'
            && bytes[3].is_ascii_digit();
        prop_assert_eq!(is_valid_preserve_downgrade_option(&value), well_formed);
    }

    #[test]
    fn upgrade_mirrors_rollback(year in 20..30u64, release in 1..3u64, patch_a in 0..20u64, patch_b in 0..20u64) {
        let current = Version::new(year, release, patch_a);
        let next = if release == 1 {
            Version::new(year, 2, patch_b)
        } else {
            Version::new(year + 1, 1, patch_b)
        };
        prop_assert_eq!(classify(&current, &next).unwrap(), UpdateKind::MajorUpgrade);
        prop_assert_eq!(classify(&next, &current).unwrap(), UpdateKind::MajorRollback);
    }

    #[test]
    fn patches_are_symmetric(year in 20..30u64, release in 1..4u64, a in 0..50u64, b in 0..50u64) {
        let x = parse_version(&format!("v{year}.{release}.{a}")).unwrap();
        let y = parse_version(&format!("v{year}.{release}.{b}")).unwrap();
        prop_assert_eq!(classify(&x, &y).unwrap(), UpdateKind::Patch);
        prop_assert_eq!(classify(&y, &x).unwrap(), UpdateKind::Patch);
    }
}
