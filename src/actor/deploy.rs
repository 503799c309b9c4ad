//! Child resources of a cluster: services, stateful set, disruption budget
//! and already exposed ingresses
//!
//! Existing stateful sets keep their replica count here; growing to `nodes`
//! goes through the scaler one pod at a time, shrinking is left to
//! decommission.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use tracing::info;

use crate::actor::{Actor, ActorError, ActorResult, pruner_for};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::crd::{ActionType, ConditionType};
use crate::resources::ingress::{IngressBuilder, IngressKind};
use crate::resources::pdb::PdbBuilder;
use crate::resources::reconcile::{Persister, reconcile};
use crate::resources::service::{DiscoveryServiceBuilder, PublicServiceBuilder};
use crate::resources::statefulset::StatefulSetBuilder;
use crate::scale::statefulset::spec_replicas;
use crate::scale::{CockroachNodeDrainer, CockroachStatefulSet, Scaler};

/// Ingresses to keep in sync: enabled in the spec and already exposed
pub fn exposed_ingresses(cluster: &Cluster) -> Vec<IngressKind> {
    let mut kinds = Vec::new();
    if cluster.is_ui_ingress_enabled() && cluster.is_true(ConditionType::UiIngressExposed) {
        kinds.push(IngressKind::Ui);
    }
    if cluster.is_sql_ingress_enabled() && cluster.is_true(ConditionType::SqlIngressExposed) {
        kinds.push(IngressKind::Sql);
    }
    kinds
}

/// Replicas to write into the stateful set
pub fn replicas_to_write(existing: Option<&StatefulSet>, nodes: i32) -> i32 {
    existing.and_then(spec_replicas).unwrap_or(nodes)
}

pub struct Deploy;

#[async_trait]
impl Actor for Deploy {
    fn action_type(&self) -> ActionType {
        ActionType::Deploy
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let cluster: &Cluster = cluster;
        let client = &ctx.client;
        let ns = cluster.namespace();
        let image = cluster
            .desired_image(&ctx.config.versions)
            .ok_or_else(|| ActorError::validation("no image or supported cockroachDBVersion is set"))?;

        let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &ns);
        let existing = sts_api.get_opt(&cluster.statefulset_name()).await?;
        let replicas = replicas_to_write(existing.as_ref(), cluster.nodes());

        let mut changed = reconcile(client, &ns, &DiscoveryServiceBuilder { cluster }, Persister::Default).await?;
        changed |= reconcile(client, &ns, &PublicServiceBuilder { cluster }, Persister::Default).await?;
        let sts = StatefulSetBuilder {
            cluster,
            image: image.clone(),
            replicas,
            database_env: &ctx.config.database_env,
        };
        changed |= reconcile(client, &ns, &sts, Persister::Annotating).await?;
        let pdb = PdbBuilder { cluster };
        if pdb.is_needed() {
            changed |= reconcile(client, &ns, &pdb, Persister::Default).await?;
        }
        for kind in exposed_ingresses(cluster) {
            changed |= reconcile(client, &ns, &IngressBuilder { cluster, kind }, Persister::Default).await?;
        }
        if changed {
            info!(%image, replicas, "deployed cluster resources");
        }

        if replicas < cluster.nodes() {
            let pruner = pruner_for(ctx, cluster);
            let scaler = Scaler {
                crdb: &CockroachStatefulSet::new(client.clone(), &ns, cluster.statefulset_name()),
                drainer: &CockroachNodeDrainer::new(client.clone(), cluster, Duration::ZERO),
                pruner: pruner.as_ref(),
            };
            scaler.ensure_scale(cluster.nodes()).await?;
            info!(from = replicas, to = cluster.nodes(), "scaled up statefulset");
        }
        Ok(())
    }
}
