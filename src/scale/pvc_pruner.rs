//! Removal of volume claims left behind by removed pods
//!
//! A claim `<template>-<sts>-<ordinal>` is in use exactly when its ordinal is
//! below the stateful set's replica count. Claims at or above it belong to
//! decommissioned nodes; reusing one on scale up would bring back a node
//! identity the database refuses to recommission, so they are deleted.
//!
//! The prune holds a watch on the stateful set for its whole duration and
//! stops before the next delete if the replica count changes underneath it.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, DeleteParams, ListParams, Preconditions, PropagationPolicy, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::resources::common::label_selector;
use crate::scale::statefulset::spec_replicas;
use crate::scale::{PvcPruner, ScaleError, ScaleResult};

/// Grace period given to each claim deletion
pub const PVC_DELETE_GRACE_SECS: u32 = 60;

/// Claims that belong to `sts` but sit at an ordinal the set no longer runs,
/// sorted by name
pub fn pvcs_to_delete(sts: &StatefulSet, pvcs: Vec<PersistentVolumeClaim>) -> Vec<PersistentVolumeClaim> {
    let sts_name = sts.name_any();
    let replicas = spec_replicas(sts).unwrap_or(0);
    let templates: Vec<String> = sts
        .spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .map(|t| t.iter().map(ResourceExt::name_any).collect())
        .unwrap_or_default();

    let mut unused: Vec<PersistentVolumeClaim> = pvcs
        .into_iter()
        .filter(|pvc| {
            let name = pvc.name_any();
            templates.iter().any(|template| {
                let prefix = format!("{template}-{sts_name}-");
                // Unfamiliar claims that merely share the labels are never touched
                let Some(ordinal) = name.strip_prefix(&prefix) else {
                    return false;
                };
                ordinal.parse::<i32>().is_ok_and(|i| i >= replicas)
            })
        })
        .collect();
    unused.sort_by_key(ResourceExt::name_any);
    unused
}

/// Why a watch event invalidates a prune started at `replicas`
pub fn watch_event_aborts(event: &WatchEvent<StatefulSet>, replicas: i32) -> Option<String> {
    match event {
        WatchEvent::Modified(sts) if spec_replicas(sts) == Some(replicas) => None,
        WatchEvent::Modified(sts) => Some(format!(
            "replicas changed from {replicas} to {:?}",
            spec_replicas(sts)
        )),
        WatchEvent::Bookmark(_) => None,
        WatchEvent::Added(_) => Some("unexpected add event".to_string()),
        WatchEvent::Deleted(_) => Some("statefulset deleted".to_string()),
        WatchEvent::Error(e) => Some(format!("watch error: {}", e.message)),
    }
}

/// Deletes unused claims of one stateful set
pub struct PersistentVolumePruner {
    client: Client,
    namespace: String,
    statefulset: String,
}

impl PersistentVolumePruner {
    pub fn new(client: Client, namespace: impl Into<String>, statefulset: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            statefulset: statefulset.into(),
        }
    }

    async fn delete_unused(&self, sts: &StatefulSet) -> ScaleResult<()> {
        let selector = sts
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &self.namespace);
        let pvcs = api
            .list(&ListParams::default().labels(&label_selector(&selector)))
            .await?
            .items;

        for pvc in pvcs_to_delete(sts, pvcs) {
            let name = pvc.name_any();
            info!(pvc = %name, "deleting unused volume claim");
            let params = DeleteParams {
                grace_period_seconds: Some(PVC_DELETE_GRACE_SECS),
                propagation_policy: Some(PropagationPolicy::Foreground),
                preconditions: Some(Preconditions {
                    uid: pvc.uid(),
                    resource_version: pvc.resource_version(),
                }),
                ..Default::default()
            };
            api.delete(&name, &params).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PvcPruner for PersistentVolumePruner {
    async fn prune(&self) -> ScaleResult<()> {
        let sts_api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let sts = sts_api.get(&self.statefulset).await?;
        let replicas = spec_replicas(&sts).ok_or_else(|| ScaleError::MissingReplicas {
            name: self.statefulset.clone(),
        })?;

        let params = WatchParams::default().fields(&format!("metadata.name={}", self.statefulset));
        let version = sts.resource_version().unwrap_or_default();
        let events = sts_api.watch(&params, &version).await?;
        debug!(statefulset = %self.statefulset, "established statefulset watch");

        let concurrent_change = async {
            let mut events = events.boxed();
            loop {
                match events.try_next().await {
                    Ok(Some(event)) => {
                        if let Some(reason) = watch_event_aborts(&event, replicas) {
                            return reason;
                        }
                    }
                    Ok(None) => return "watch closed".to_string(),
                    Err(e) => return format!("watch failed: {e}"),
                }
            }
        };

        tokio::select! {
            reason = concurrent_change => {
                warn!(statefulset = %self.statefulset, %reason, "aborting volume claim prune");
                Err(ScaleError::ConcurrentModification {
                    name: self.statefulset.clone(),
                    reason,
                })
            }
            result = self.delete_unused(&sts) => result,
        }
    }
}

/// Pruner used while the AutoPrunePVC gate is off; claims are left for the
/// user to delete
pub struct DisabledPruner;

#[async_trait]
impl PvcPruner for DisabledPruner {
    async fn prune(&self) -> ScaleResult<()> {
        debug!("volume claim pruning is disabled");
        Ok(())
    }
}
