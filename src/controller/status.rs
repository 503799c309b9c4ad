//! Condition and action ledger for CrdbCluster resources
//!
//! Conditions are three-valued, actions four-valued. Timestamps only move
//! when a status changes. Persistence is split in two: the ledger goes
//! through the status sub-resource, annotations through a regular object
//! update guarded by resourceVersion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::Api;
use kube::api::{Patch, PatchParams, PostParams};
use tracing::debug;

use crate::controller::Context;
use crate::controller::error::is_kube_conflict;
use crate::crd::{
    ActionStatus, ActionType, ClusterAction, ClusterCondition, ConditionStatus, ConditionType,
    CrdbCluster, CrdbClusterStatus,
};
use crate::resources::common::FIELD_MANAGER;

/// Attempts made when an annotation write hits a stale resourceVersion
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Conditions seeded on the first reconcile
const INITIAL_CONDITIONS: [ConditionType; 2] =
    [ConditionType::Initialized, ConditionType::CrdbVersionChecked];

impl CrdbClusterStatus {
    /// Seed the conditions every cluster starts with. Existing entries are kept.
    pub fn init_conditions(&mut self, now: DateTime<Utc>) {
        for type_ in INITIAL_CONDITIONS {
            if !self.has(type_) {
                self.set_condition(type_, ConditionStatus::False, now);
            }
        }
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&ClusterCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn has(&self, type_: ConditionType) -> bool {
        self.condition(type_).is_some()
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn is_false(&self, type_: ConditionType) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::False)
    }

    /// Set a condition, adding it if absent. The transition time changes
    /// only when the status does.
    pub fn set_condition(&mut self, type_: ConditionType, status: ConditionStatus, now: DateTime<Utc>) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now.to_rfc3339();
            }
        } else {
            self.conditions.push(ClusterCondition {
                type_,
                status,
                last_transition_time: now.to_rfc3339(),
            });
        }
    }

    pub fn action(&self, type_: ActionType) -> Option<&ClusterAction> {
        self.operator_actions.iter().find(|a| a.type_ == type_)
    }

    /// Record an action outcome, one entry per action type
    pub fn set_action(
        &mut self,
        type_: ActionType,
        status: ActionStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = self.operator_actions.iter_mut().find(|a| a.type_ == type_) {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now.to_rfc3339();
            }
            existing.message = message;
        } else {
            self.operator_actions.push(ClusterAction {
                type_,
                status,
                message,
                last_transition_time: now.to_rfc3339(),
            });
        }
    }

    /// Recompute `clusterStatus`: any failed action fails the cluster, any
    /// unknown action makes it unknown, otherwise it is finished.
    pub fn aggregate_cluster_status(&mut self) {
        let statuses = self.operator_actions.iter().map(|a| a.status);
        let aggregate = statuses.fold(ActionStatus::Finished, |acc, s| match (acc, s) {
            (ActionStatus::Failed, _) | (_, ActionStatus::Failed) => ActionStatus::Failed,
            (ActionStatus::Unknown, _) | (_, ActionStatus::Unknown) => ActionStatus::Unknown,
            _ => ActionStatus::Finished,
        });
        self.cluster_status = Some(aggregate.to_string());
    }
}

/// Persists status and annotations of one cluster
pub struct StatusManager<'a> {
    ctx: &'a Context,
    ns: String,
    name: String,
}

impl<'a> StatusManager<'a> {
    pub fn new(ctx: &'a Context, ns: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ctx,
            ns: ns.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<CrdbCluster> {
        Api::namespaced(self.ctx.client.clone(), &self.ns)
    }

    /// Write the full status through the status sub-resource
    pub async fn update(&self, status: &CrdbClusterStatus) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "status": status
        });

        self.api()
            .patch_status(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;

        Ok(())
    }

    /// Apply annotation changes (`None` removes a key) on the latest copy of
    /// the object, re-fetching when the write loses a resourceVersion race
    pub async fn update_annotations(
        &self,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<CrdbCluster, kube::Error> {
        let api = self.api();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut latest = api.get(&self.name).await?;
            apply_annotation_changes(&mut latest, changes);

            match api.replace(&self.name, &PostParams::default(), &latest).await {
                Ok(updated) => return Ok(updated),
                Err(e) if is_kube_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    debug!(attempt, "annotation update conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Apply annotation changes to an object in memory
pub fn apply_annotation_changes(
    object: &mut CrdbCluster,
    changes: &BTreeMap<String, Option<String>>,
) {
    let annotations = object
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new);
    for (key, value) in changes {
        match value {
            Some(v) => {
                annotations.insert(key.clone(), v.clone());
            }
            None => {
                annotations.remove(key);
            }
        }
    }
}
