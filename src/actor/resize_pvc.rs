//! Grow the data volumes of a running cluster
//!
//! Claim templates of a stateful set are immutable. Each bound claim is
//! resized in place, then the stateful set is deleted with orphaned pods and
//! created again carrying the new template.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::ResourceExt;
use tracing::info;

use crate::actor::decommission::all_replicas_current;
use crate::actor::{Actor, ActorError, ActorResult};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::controller::error::BackoffConfig;
use crate::crd::ActionType;
use crate::resources::common::{label_selector, parse_quantity, storage_request};
use crate::resources::reconcile::Builder;
use crate::resources::statefulset::StatefulSetBuilder;
use crate::scale::statefulset::spec_replicas;
use crate::update::partitioned::is_updating;
use crate::versions::VersionWhitelist;

/// How long recreating the stateful set may take
pub const RECREATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Requested storage of the first claim template of a stateful set
pub fn statefulset_storage(sts: &StatefulSet) -> Option<&Quantity> {
    sts.spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .and_then(|t| t.first())
        .and_then(|pvc| pvc.spec.as_ref())
        .and_then(storage_request)
}

/// Storage the cluster spec asks for
pub fn desired_storage(cluster: &Cluster) -> Option<&Quantity> {
    cluster
        .spec()
        .data_store
        .claim_template()
        .and_then(storage_request)
}

/// The spec asks for more storage than the stateful set template has
pub fn needs_resize(cluster: &Cluster, sts: &StatefulSet) -> bool {
    let wanted = desired_storage(cluster).and_then(|q| parse_quantity(&q.0));
    let current = statefulset_storage(sts).and_then(|q| parse_quantity(&q.0));
    match (wanted, current) {
        (Some(wanted), Some(current)) => wanted > current,
        _ => false,
    }
}

/// Claims bound to the first `replicas` ordinals, sorted by name
pub fn claims_in_use(cluster: &Cluster, replicas: i32, pvcs: Vec<PersistentVolumeClaim>) -> Vec<PersistentVolumeClaim> {
    let names: Vec<String> = (0..replicas).map(|i| cluster.pvc_name(i)).collect();
    let mut in_use: Vec<PersistentVolumeClaim> = pvcs
        .into_iter()
        .filter(|pvc| names.contains(&pvc.name_any()))
        .collect();
    in_use.sort_by_key(ResourceExt::name_any);
    in_use
}

fn set_storage(pvc: &mut PersistentVolumeClaim, size: &Quantity) {
    let requests = pvc
        .spec
        .get_or_insert_with(Default::default)
        .resources
        .get_or_insert_with(Default::default)
        .requests
        .get_or_insert_with(Default::default);
    requests.insert("storage".to_string(), size.clone());
}

/// The stateful set written after the claims were resized. Built before
/// anything is changed, so a missing image leaves the running set in place.
pub fn replacement_statefulset(
    cluster: &Cluster,
    versions: &VersionWhitelist,
    replicas: i32,
    database_env: &[(String, String)],
) -> ActorResult<StatefulSet> {
    let image = cluster
        .desired_image(versions)
        .ok_or_else(|| ActorError::validation("no image or supported cockroachDBVersion is set"))?;
    let desired = StatefulSetBuilder {
        cluster,
        image,
        replicas,
        database_env,
    }
    .build()?;
    Ok(desired)
}

pub struct ResizePvc;

#[async_trait]
impl Actor for ResizePvc {
    fn action_type(&self) -> ActionType {
        ActionType::ResizePvc
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let cluster: &Cluster = cluster;
        let Some(size) = desired_storage(cluster).cloned() else {
            return Ok(());
        };
        if !cluster.spec().data_store.supports_auto_resize {
            return Err(ActorError::validation(
                "the data store does not support volume expansion, set supportsAutoResize",
            ));
        }

        let client = &ctx.client;
        let ns = cluster.namespace();
        let sts_name = cluster.statefulset_name();
        let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &ns);
        let sts = sts_api.get(&sts_name).await?;
        if is_updating(&sts) {
            return Err(ActorError::not_ready(
                "resize statefulset is updating, waiting for the update to finish",
            ));
        }
        if !all_replicas_current(&sts) {
            return Err(ActorError::not_ready("statefulset does not have all replicas up"));
        }
        if !needs_resize(cluster, &sts) {
            return Ok(());
        }

        let replicas = spec_replicas(&sts).unwrap_or(cluster.nodes());
        let desired =
            replacement_statefulset(cluster, &ctx.config.versions, replicas, &ctx.config.database_env)?;

        let pvc_api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);
        let pvcs = pvc_api
            .list(&ListParams::default().labels(&label_selector(&cluster.selector())))
            .await?
            .items;
        for mut pvc in claims_in_use(cluster, replicas, pvcs) {
            let name = pvc.name_any();
            set_storage(&mut pvc, &size);
            pvc_api.replace(&name, &PostParams::default(), &pvc).await?;
            info!(pvc = %name, size = %size.0, "resized volume claim");
        }

        let orphan = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Orphan),
            ..Default::default()
        };
        sts_api.delete(&sts_name, &orphan).await?;
        info!(statefulset = %sts_name, "deleted statefulset, keeping its pods");

        let backoff = BackoffConfig::polling(Duration::from_secs(1), Duration::from_secs(15));
        let (api, name, desired) = (&sts_api, sts_name.as_str(), &desired);
        backoff
            .retry(
                RECREATE_TIMEOUT,
                || async move {
                    if api.get_opt(name).await?.is_some() {
                        return Err(ActorError::not_ready("old statefulset is still being deleted"));
                    }
                    api.create(&PostParams::default(), desired).await?;
                    Ok(())
                },
                ActorError::is_retryable,
            )
            .await?;
        info!(statefulset = %sts_name, size = %size.0, "recreated statefulset with resized claim template");
        Ok(())
    }
}
