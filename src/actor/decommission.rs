//! Scale down by decommissioning the highest ordinals first

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use tracing::info;

use crate::actor::{Actor, ActorError, ActorResult, pruner_for};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::controller::validation::MIN_NODES;
use crate::crd::{ActionType, ConditionType};
use crate::resources::cluster_sql::range_move_duration;
use crate::resources::database::DbConnection;
use crate::scale::drainer::RANGE_RELOCATION_FACTOR;
use crate::scale::{CockroachNodeDrainer, CockroachStatefulSet, Scaler};

/// Every requested replica is up to date and running
pub fn all_replicas_current(sts: &StatefulSet) -> bool {
    sts.status.as_ref().is_some_and(|s| {
        let current = s.current_replicas.unwrap_or(0);
        current > 0 && current >= s.replicas
    })
}

pub struct Decommission;

#[async_trait]
impl Actor for Decommission {
    fn action_type(&self) -> ActionType {
        ActionType::Decommission
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let nodes = cluster.nodes();
        if nodes < MIN_NODES {
            return Err(ActorError::validation(format!(
                "decommission with {nodes} nodes is below minimum of {MIN_NODES}"
            )));
        }

        let client = &ctx.client;
        let ns = cluster.namespace();
        let sts_name = cluster.statefulset_name();
        let sts = Api::<StatefulSet>::namespaced(client.clone(), &ns)
            .get(&sts_name)
            .await?;
        if !all_replicas_current(&sts) {
            return Err(ActorError::not_ready("statefulset does not have all replicas up"));
        }

        cluster.set_false(ConditionType::Decommission);

        let db = DbConnection::connect(client, cluster, ctx.config.in_cluster).await?;
        let timeout = range_move_duration(db.client()).await? * RANGE_RELOCATION_FACTOR;
        info!(nodes, timeout_secs = timeout.as_secs(), "decommissioning surplus nodes");

        let pruner = pruner_for(ctx, cluster);
        let scaler = Scaler {
            crdb: &CockroachStatefulSet::new(client.clone(), &ns, &sts_name),
            drainer: &CockroachNodeDrainer::new(client.clone(), cluster, timeout),
            pruner: pruner.as_ref(),
        };
        scaler.ensure_scale(nodes).await?;

        cluster.set_true(ConditionType::Decommission);
        info!(nodes, "decommission finished");
        Ok(())
    }
}
