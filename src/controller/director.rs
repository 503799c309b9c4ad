//! Picks the one action a reconcile runs
//!
//! [`observe`] gathers what the predicates need from the API server; the
//! predicates themselves are pure so the priority order can be tested without
//! one. [`pick`] returns the first action in [`ActionType::ALL`] whose
//! predicate holds.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::Api;
use tracing::debug;

use crate::actor::deploy::{exposed_ingresses, replicas_to_write};
use crate::actor::resize_pvc::needs_resize;
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::crd::{ActionType, ConditionType};
use crate::features::{Feature, FeatureGates};
use crate::resources::ResourceError;
use crate::resources::common::annotations;
use crate::resources::ingress::IngressBuilder;
use crate::resources::pdb::PdbBuilder;
use crate::resources::reconcile::{Persister, needs_update};
use crate::resources::service::{DiscoveryServiceBuilder, PublicServiceBuilder};
use crate::resources::statefulset::StatefulSetBuilder;

/// State of the children the predicates look at
#[derive(Clone, Debug, Default)]
pub struct Observed {
    pub service_account_exists: bool,
    pub statefulset: Option<StatefulSet>,
    /// A child differs from what the builders produce
    pub children_drifted: bool,
}

impl Observed {
    fn statefulset_annotation(&self, key: &str) -> Option<&str> {
        self.statefulset
            .as_ref()
            .and_then(|s| s.metadata.annotations.as_ref())
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

async fn children_drifted(ctx: &Context, cluster: &Cluster, sts: Option<&StatefulSet>) -> Result<bool, ResourceError> {
    let client = &ctx.client;
    let ns = cluster.namespace();
    let Some(image) = cluster.desired_image(&ctx.config.versions) else {
        // Deploy reports the missing image
        return Ok(true);
    };

    if needs_update(client, &ns, &DiscoveryServiceBuilder { cluster }, Persister::Default).await?
        || needs_update(client, &ns, &PublicServiceBuilder { cluster }, Persister::Default).await?
    {
        return Ok(true);
    }
    let sts_builder = StatefulSetBuilder {
        cluster,
        image,
        replicas: replicas_to_write(sts, cluster.nodes()),
        database_env: &ctx.config.database_env,
    };
    if needs_update(client, &ns, &sts_builder, Persister::Annotating).await? {
        return Ok(true);
    }
    let pdb = PdbBuilder { cluster };
    if pdb.is_needed() && needs_update(client, &ns, &pdb, Persister::Default).await? {
        return Ok(true);
    }
    for kind in exposed_ingresses(cluster) {
        if needs_update(client, &ns, &IngressBuilder { cluster, kind }, Persister::Default).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Read the children the predicates depend on
pub async fn observe(ctx: &Context, cluster: &Cluster) -> Result<Observed, ResourceError> {
    let ns = cluster.namespace();
    let service_account_exists = Api::<ServiceAccount>::namespaced(ctx.client.clone(), &ns)
        .get_opt(&cluster.service_account_name())
        .await?
        .is_some();
    let statefulset = Api::<StatefulSet>::namespaced(ctx.client.clone(), &ns)
        .get_opt(&cluster.statefulset_name())
        .await?;

    // Drift only matters when Deploy could run
    let children_drifted = if ctx.config.features.enabled(Feature::Deploy) && service_account_exists {
        children_drifted(ctx, cluster, statefulset.as_ref()).await?
    } else {
        false
    };

    Ok(Observed {
        service_account_exists,
        statefulset,
        children_drifted,
    })
}

fn initialized_known(cluster: &Cluster) -> bool {
    cluster.is_true(ConditionType::Initialized) || cluster.is_false(ConditionType::Initialized)
}

/// With the version gate on, later actions wait for a checked version
fn version_checked(cluster: &Cluster, features: &FeatureGates) -> bool {
    !features.enabled(Feature::CrdbVersionValidator) || cluster.is_true(ConditionType::CrdbVersionChecked)
}

fn replica_counts(observed: &Observed) -> Option<(i32, i32)> {
    let status = observed.statefulset.as_ref()?.status.as_ref()?;
    Some((status.current_replicas.unwrap_or(0), status.replicas))
}

/// Whether `action` should run for this state
pub fn handles(action: ActionType, cluster: &Cluster, features: &FeatureGates, observed: &Observed) -> bool {
    let nodes = cluster.nodes();
    match action {
        ActionType::ClusterRestart => {
            features.enabled(Feature::ClusterRestart)
                && version_checked(cluster, features)
                && initialized_known(cluster)
                && cluster.restart_type_annotation().is_some()
        }
        ActionType::SetupRbac => !observed.service_account_exists,
        ActionType::Decommission => {
            features.enabled(Feature::Decommission)
                && cluster.is_true(ConditionType::Initialized)
                && replica_counts(observed).is_some_and(|(current, replicas)| current == replicas && current > nodes)
        }
        ActionType::VersionCheck => {
            features.enabled(Feature::CrdbVersionValidator)
                && cluster.is_false(ConditionType::CrdbVersionChecked)
                && initialized_known(cluster)
        }
        ActionType::GenerateCert => {
            let host_changed = cluster.status().sql_host.as_deref() != cluster.spec().sql_ingress_host();
            cluster.owns_certificates()
                && (!cluster.is_true(ConditionType::CertificateGenerated) || host_changed)
                && version_checked(cluster, features)
        }
        ActionType::PartitionedUpdate => {
            let running = observed.statefulset_annotation(annotations::VERSION);
            let wanted = cluster.version_annotation();
            cluster.is_true(ConditionType::Initialized)
                && version_checked(cluster, features)
                && matches!((running, wanted), (Some(r), Some(w)) if r != w)
        }
        ActionType::ResizePvc => {
            features.enabled(Feature::ResizePvc)
                && cluster.is_true(ConditionType::Initialized)
                && observed
                    .statefulset
                    .as_ref()
                    .is_some_and(|sts| needs_resize(cluster, sts))
        }
        ActionType::Deploy => {
            let short = observed
                .statefulset
                .as_ref()
                .is_none_or(|sts| replicas_to_write(Some(sts), nodes) < nodes);
            features.enabled(Feature::Deploy)
                && initialized_known(cluster)
                && version_checked(cluster, features)
                && (observed.children_drifted || short)
        }
        ActionType::Initialize => {
            cluster.is_false(ConditionType::Initialized) && version_checked(cluster, features)
        }
        ActionType::ExposeIngress => {
            cluster.is_ui_ingress_enabled() != cluster.is_true(ConditionType::UiIngressExposed)
                || cluster.is_sql_ingress_enabled() != cluster.is_true(ConditionType::SqlIngressExposed)
        }
    }
}

/// Highest-priority action that applies, if any
pub fn pick(cluster: &Cluster, features: &FeatureGates, observed: &Observed) -> Option<ActionType> {
    let picked = ActionType::ALL
        .into_iter()
        .find(|action| handles(*action, cluster, features, observed));
    debug!(action = ?picked, "director pick");
    picked
}
