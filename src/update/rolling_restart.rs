//! Pod restarts driven by the restart-type annotation
//!
//! A rolling restart stamps the pod template and lets the partitioned
//! updater recreate one ordinal at a time. A full-cluster restart takes every
//! pod down at once by scaling to zero and back, which bypasses the
//! disruption budget and is only ever requested by a user.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::info;

use crate::resources::common::{FIELD_MANAGER, annotations};
use crate::scale::ClusterScaler;
use crate::update::partitioned::{PartitionedUpdater, PodTarget, stamp_restart};
use crate::update::UpdateResult;

/// Verification target of a rolling restart stamped with `stamp`
pub fn restart_target(stamp: &str) -> PodTarget {
    PodTarget::Annotation {
        key: annotations::RESTARTED_AT.to_string(),
        value: stamp.to_string(),
    }
}

/// Recreate every pod, highest ordinal first
pub async fn rolling_restart(updater: &PartitionedUpdater<'_>, stamp: &str) -> UpdateResult<()> {
    info!(%stamp, "starting rolling restart");
    updater
        .run(
            |sts| {
                stamp_restart(sts, stamp);
                Ok(())
            },
            &restart_target(stamp),
        )
        .await
}

/// Stop every pod, then bring `nodes` pods back
pub async fn full_cluster_restart(
    client: &Client,
    namespace: &str,
    statefulset: &str,
    scaler: &dyn ClusterScaler,
    nodes: i32,
    stamp: &str,
) -> UpdateResult<()> {
    info!(%statefulset, nodes, "starting full cluster restart");
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let stamped = BTreeMap::from([(annotations::RESTARTED_AT, stamp)]);
    let patch = serde_json::json!({
        "spec": { "template": { "metadata": { "annotations": stamped } } }
    });
    api.patch(statefulset, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    scaler.set_replicas(0).await?;
    scaler.wait_until_healthy(0).await?;
    scaler.set_replicas(nodes).await?;
    scaler.wait_until_healthy(nodes).await?;
    info!(%statefulset, nodes, "full cluster restart finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_target_uses_stamp() {
        assert_eq!(
            restart_target("2024-01-01T00:00:00+00:00"),
            PodTarget::Annotation {
                key: "crdb.cockroachlabs.com/restartedAt".into(),
                value: "2024-01-01T00:00:00+00:00".into(),
            }
        );
    }
}
