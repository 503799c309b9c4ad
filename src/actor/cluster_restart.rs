//! Restart requested through the `crdb.cockroachlabs.com/restartType`
//! annotation. The annotation is removed once the restart went through.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use tracing::info;

use crate::actor::decommission::all_replicas_current;
use crate::actor::{Actor, ActorError, ActorResult};
use crate::cluster::{Cluster, RestartType};
use crate::controller::context::Context;
use crate::controller::status::StatusManager;
use crate::crd::{ActionType, ConditionType};
use crate::health_checker::CockroachHealthChecker;
use crate::resources::common::annotations;
use crate::scale::CockroachStatefulSet;
use crate::update::PartitionedUpdater;
use crate::update::partitioned::is_updating;
use crate::update::rolling_restart::{full_cluster_restart, rolling_restart};

/// Annotation changes recorded after a restart stamped with `stamp`
pub fn finished_restart_annotations(stamp: &str) -> BTreeMap<String, Option<String>> {
    BTreeMap::from([
        (annotations::RESTART_TYPE.to_string(), None),
        (annotations::RESTARTED_AT.to_string(), Some(stamp.to_string())),
    ])
}

pub struct ClusterRestart;

#[async_trait]
impl Actor for ClusterRestart {
    fn action_type(&self) -> ActionType {
        ActionType::ClusterRestart
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let requested = cluster.restart_type_annotation().unwrap_or_default().to_string();
        let restart = RestartType::parse(&requested).ok_or_else(|| {
            ActorError::validation(format!(
                "unknown restart type {requested:?}, use Rolling or FullCluster"
            ))
        })?;

        let client = &ctx.client;
        let ns = cluster.namespace();
        let sts_name = cluster.statefulset_name();
        let sts = Api::<StatefulSet>::namespaced(client.clone(), &ns)
            .get(&sts_name)
            .await?;
        if is_updating(&sts) {
            return Err(ActorError::not_ready(
                "restart statefulset is updating, waiting for the update to finish",
            ));
        }
        if !all_replicas_current(&sts) {
            return Err(ActorError::not_ready("statefulset does not have all replicas up"));
        }

        let stamp = Utc::now().to_rfc3339();
        info!(restart = restart.as_str(), %stamp, "restarting cluster");
        match restart {
            RestartType::Rolling => {
                let checker = CockroachHealthChecker::new(client.clone(), cluster);
                let updater = PartitionedUpdater::new(client.clone(), &ns, &sts_name, &checker);
                rolling_restart(&updater, &stamp).await?;
            }
            RestartType::FullCluster => {
                let scaler = CockroachStatefulSet::new(client.clone(), &ns, &sts_name);
                full_cluster_restart(client, &ns, &sts_name, &scaler, cluster.nodes(), &stamp).await?;
            }
        }

        let updated = StatusManager::new(ctx, &ns, cluster.name())
            .update_annotations(&finished_restart_annotations(&stamp))
            .await?;
        cluster.refresh(updated);
        cluster.set_true(ConditionType::RestartedCluster);
        info!(restart = restart.as_str(), "cluster restart finished");
        Ok(())
    }
}
