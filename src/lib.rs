pub mod actor;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod features;
pub mod health;
pub mod health_checker;
pub mod resources;
pub mod scale;
pub mod security;
pub mod update;
pub mod versions;

pub use controller::{
    BackoffConfig, Context, Error, OperatorConfig, Result, error_policy, reconcile,
};
pub use crd::CrdbCluster;
pub use health::{HealthState, Metrics};

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::{self as kube_controller, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

/// Api for `T` in one namespace, or across all of them
fn watch_api<T>(client: &Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    T::DynamicType: Default,
{
    namespace.map_or_else(
        || Api::all(client.clone()),
        |ns| Api::namespaced(client.clone(), ns),
    )
}

/// The CrdbCluster controller together with every child kind it owns
fn cluster_controller(client: &Client, namespace: Option<&str>) -> Controller<CrdbCluster> {
    let cfg = watcher::Config::default().any_semantic();
    Controller::new(watch_api::<CrdbCluster>(client, namespace), cfg.clone())
        .owns(watch_api::<StatefulSet>(client, namespace), cfg.clone())
        .owns(watch_api::<Service>(client, namespace), cfg.clone())
        .owns(watch_api::<PodDisruptionBudget>(client, namespace), cfg.clone())
        .owns(watch_api::<ServiceAccount>(client, namespace), cfg.clone())
        .owns(watch_api::<Ingress>(client, namespace), cfg.clone())
        .owns(watch_api::<Secret>(client, namespace), cfg)
}

type ControllerResult =
    std::result::Result<(ObjectRef<CrdbCluster>, Action), kube_controller::Error<Error, watcher::Error>>;

fn log_result(result: ControllerResult) {
    match result {
        Ok((object, action)) => debug!(cluster = %object, ?action, "reconciled"),
        // A child event can outlive the cluster that owned it
        Err(kube_controller::Error::ReconcilerFailed(e, object)) if e.is_not_found() => {
            debug!(cluster = %object, "cluster is gone");
        }
        Err(e) => error!(error = ?e, "reconcile failed"),
    }
}

/// Run the CrdbCluster controller until its watch streams end.
///
/// The scope is `config.watch_namespace`, or every namespace when unset.
/// With a `health_state`, readiness is raised once the controller starts
/// and every pass feeds its metrics.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    info!(
        scope = namespace.as_deref().unwrap_or("cluster-wide"),
        "starting CrdbCluster controller"
    );

    let controller = cluster_controller(&client, namespace.as_deref());
    if let Some(state) = &health_state {
        state.set_ready(true);
    }

    let ctx = Arc::new(Context::new(client, Arc::new(config), health_state));
    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_result(result) })
        .await;

    error!("controller stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_result_accepts_controller_outcomes() {
        let crdb = ObjectRef::<CrdbCluster>::new("crdb").within("db");
        log_result(Ok((crdb.clone(), Action::await_change())));

        let gone = Error::NotFound("crdb".into());
        assert!(gone.is_not_found());
        log_result(Err(kube_controller::Error::ReconcilerFailed(gone, crdb.clone().erase())));

        let invalid = Error::ValidationError("nodes".into());
        log_result(Err(kube_controller::Error::ReconcilerFailed(invalid, crdb.erase())));
    }
}
