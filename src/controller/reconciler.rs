//! Reconciliation loop for CrdbCluster resources
//!
//! Every pass re-reads the object, asks the director for at most one action,
//! runs it and records the outcome in the status ledger. Children carry owner
//! references, so deletion needs no finalizer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, error, info, instrument, warn};

use crate::actor::{ActorError, ActorResult, actor_for};
use crate::cluster::{Cluster, Fetcher};
use crate::controller::context::Context;
use crate::controller::director::{Observed, observe, pick};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::status::StatusManager;
use crate::controller::validation::validate_spec;
use crate::crd::{ActionStatus, ActionType, ConditionType, CrdbCluster};
use crate::features::Feature;
use crate::health::ClusterLabels;

/// Requeue after an action finished so the next one gets picked
pub const NEXT_ACTION_DELAY: Duration = Duration::from_secs(1);

/// Requeue while an action waits on a precondition
pub const NOT_READY_DELAY: Duration = Duration::from_secs(5);

/// Cluster status before any action has run
pub const STARTING_STATUS: &str = "Starting";

/// How a reconcile ends once the picked action returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    /// Precondition not met, check again soon
    Waiting,
    /// Transient failure, retry with backoff
    Retry,
    /// The user has to change something
    Failed,
}

impl Outcome {
    pub fn of(result: &ActorResult<()>) -> Self {
        match result {
            Ok(()) => Outcome::Finished,
            Err(ActorError::NotReady { .. }) => Outcome::Waiting,
            Err(ActorError::Transient { .. }) => Outcome::Retry,
            Err(ActorError::Validation { .. } | ActorError::Permanent { .. }) => Outcome::Failed,
        }
    }

    /// Ledger status written for this outcome
    pub fn action_status(&self) -> ActionStatus {
        match self {
            Outcome::Finished => ActionStatus::Finished,
            Outcome::Waiting => ActionStatus::Unknown,
            Outcome::Retry => ActionStatus::Starting,
            Outcome::Failed => ActionStatus::Failed,
        }
    }
}

/// Record an action result in the in-memory ledger
pub fn record_outcome(cluster: &mut Cluster, action: ActionType, result: &ActorResult<()>) -> Outcome {
    let outcome = Outcome::of(result);
    match (outcome, result) {
        (Outcome::Finished, _) => cluster.set_action_finished(action),
        (Outcome::Failed, Err(e)) => cluster.set_action_failed(action, e.message().to_string()),
        (_, Err(e)) => {
            cluster.set_action_status(action, outcome.action_status(), Some(e.message().to_string()))
        }
        (_, Ok(())) => {}
    }
    outcome
}

/// Seed conditions and the initial cluster status on a freshly read object
pub fn prepare(cluster: &mut Cluster) {
    let status = cluster.status_mut();
    status.init_conditions(Utc::now());
    if status.cluster_status.is_none() {
        status.cluster_status = Some(STARTING_STATUS.to_string());
    }
}

/// A changed image invalidates the last version check
pub fn invalidate_version_check(cluster: &mut Cluster, ctx: &Context) {
    if !ctx.config.features.enabled(Feature::CrdbVersionValidator) {
        return;
    }
    let desired = cluster.desired_image(&ctx.config.versions);
    if desired.is_some() && desired.as_deref() != cluster.container_image_annotation() {
        cluster.set_false(ConditionType::CrdbVersionChecked);
    }
}

fn record_node_metrics(ctx: &Context, cluster: &Cluster, observed: &Observed) {
    let Some(ref state) = ctx.health_state else {
        return;
    };
    let ready = observed
        .statefulset
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let labels = ClusterLabels::new(&cluster.namespace(), &cluster.name());
    state.metrics.nodes(&labels, cluster.nodes(), ready);
}

/// Main reconciliation function
#[instrument(skip(object, ctx), fields(name = %object.name_any(), namespace = object.namespace().unwrap_or_default()))]
pub async fn reconcile(object: Arc<CrdbCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = object.namespace().unwrap_or_default();
    let name = object.name_any();

    let result = reconcile_cluster(&ctx, &ns, &name).await;
    if result.is_ok() {
        ctx.failures.reset(&ObjectRef::from_obj(object.as_ref()));
    }

    if let Some(ref state) = ctx.health_state {
        let labels = ClusterLabels::new(&ns, &name);
        match &result {
            Ok(_) => state.metrics.reconciled(&labels, start.elapsed()),
            Err(_) => state.metrics.reconcile_failed(&labels),
        }
    }
    result
}

async fn reconcile_cluster(ctx: &Context, ns: &str, name: &str) -> Result<Action> {
    let Some(fetched) = Fetcher::new(ctx.client.clone()).fetch(ns, name).await? else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };

    let mut cluster = Cluster::new(fetched);
    prepare(&mut cluster);
    invalidate_version_check(&mut cluster, ctx);

    let observed = observe(ctx, &cluster).await?;
    record_node_metrics(ctx, &cluster, &observed);
    let status = StatusManager::new(ctx, ns, name);

    let Some(action) = pick(&cluster, &ctx.config.features, &observed) else {
        debug!("no action needed");
        status.update(cluster.status()).await?;
        return Ok(Action::await_change());
    };

    if let Err(e) = validate_spec(cluster.spec()) {
        warn!(action = action.as_str(), error = %e, "cluster spec is invalid");
        cluster.set_action_failed(action, e.to_string());
        status.update(cluster.status()).await?;
        record_action(ctx, action, ActionStatus::Failed);
        return Ok(Action::await_change());
    }

    info!(action = action.as_str(), "running action");
    cluster.set_action_status(action, ActionStatus::Starting, None);
    status.update(cluster.status()).await?;

    let result = actor_for(action).act(ctx, &mut cluster).await;
    let outcome = record_outcome(&mut cluster, action, &result);
    status.update(cluster.status()).await?;
    record_action(ctx, action, outcome.action_status());

    match (outcome, result) {
        (Outcome::Finished, _) => {
            info!(action = action.as_str(), "action finished");
            Ok(Action::requeue(NEXT_ACTION_DELAY))
        }
        (Outcome::Waiting, Err(e)) => {
            info!(action = action.as_str(), reason = %e.message(), "action waiting");
            Ok(Action::requeue(NOT_READY_DELAY))
        }
        (Outcome::Retry, Err(source)) => Err(Error::ActionError {
            action: action.as_str(),
            source,
        }),
        (Outcome::Failed, Err(e)) => {
            error!(action = action.as_str(), error = %e, "action failed");
            Ok(Action::await_change())
        }
        (_, Ok(())) => Ok(Action::requeue(NEXT_ACTION_DELAY)),
    }
}

fn record_action(ctx: &Context, action: ActionType, status: ActionStatus) {
    if let Some(ref state) = ctx.health_state {
        state.metrics.action(action, status);
    }
}

/// Error policy for the controller with exponential backoff
///
/// The delay grows with the number of consecutive failures of the same
/// cluster; a successful reconcile resets it.
pub fn error_policy(object: Arc<CrdbCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = object.name_any();
    let attempt = ctx.failures.record(&ObjectRef::from_obj(object.as_ref()));
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(%name, %error, attempt, ?delay, "retryable error, requeuing");
    } else {
        error!(%name, %error, ?delay, "non-retryable error, requeuing for manual intervention");
    }

    Action::requeue(delay)
}
