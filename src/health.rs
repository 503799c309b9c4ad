//! Probe and metrics endpoints served next to the controller
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller has started, and `/metrics` exposes the Prometheus registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;

use crate::crd::{ActionStatus, ActionType};

/// Environment variable overriding the probe port
pub const HEALTH_PORT_ENV: &str = "HEALTH_PORT";

pub const DEFAULT_HEALTH_PORT: u16 = 8080;

const METRIC_PREFIX: &str = "cockroach_operator";

const OPENMETRICS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Identifies one CrdbCluster in metric series
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ActionLabels {
    action: String,
    status: String,
}

/// Operator metrics, registered once per process
pub struct Metrics {
    reconciles: Family<ClusterLabels, Counter>,
    reconcile_failures: Family<ClusterLabels, Counter>,
    reconcile_seconds: Family<ClusterLabels, Histogram>,
    actions: Family<ActionLabels, Counter>,
    nodes_desired: Family<ClusterLabels, Gauge>,
    nodes_ready: Family<ClusterLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRIC_PREFIX);

        let reconciles = Family::default();
        registry.register("reconciliations", "Reconcile passes that completed", reconciles.clone());

        let reconcile_failures = Family::default();
        registry.register(
            "reconciliation_errors",
            "Reconcile passes that returned an error",
            reconcile_failures.clone(),
        );

        // 1ms up to roughly 16s
        let reconcile_seconds = Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of one reconcile pass",
            reconcile_seconds.clone(),
        );

        let actions = Family::default();
        registry.register("actions", "Actions run, by type and resulting status", actions.clone());

        let nodes_desired = Family::default();
        registry.register(
            "cluster_nodes_desired",
            "Nodes requested in the cluster spec",
            nodes_desired.clone(),
        );

        let nodes_ready = Family::default();
        registry.register(
            "cluster_nodes_ready",
            "Database pods reporting ready",
            nodes_ready.clone(),
        );

        Self {
            reconciles,
            reconcile_failures,
            reconcile_seconds,
            actions,
            nodes_desired,
            nodes_ready,
            registry,
        }
    }

    pub fn reconciled(&self, cluster: &ClusterLabels, took: Duration) {
        self.reconciles.get_or_create(cluster).inc();
        self.reconcile_seconds
            .get_or_create(cluster)
            .observe(took.as_secs_f64());
    }

    pub fn reconcile_failed(&self, cluster: &ClusterLabels) {
        self.reconcile_failures.get_or_create(cluster).inc();
    }

    /// Count one action ending in `status`
    pub fn action(&self, action: ActionType, status: ActionStatus) {
        let labels = ActionLabels {
            action: action.as_str().to_string(),
            status: status.as_str().to_string(),
        };
        self.actions.get_or_create(&labels).inc();
    }

    pub fn nodes(&self, cluster: &ClusterLabels, desired: i32, ready: i32) {
        self.nodes_desired
            .get_or_create(cluster)
            .set(i64::from(desired));
        self.nodes_ready.get_or_create(cluster).set(i64::from(ready));
    }

    /// Render the registry in the text exposition format
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

/// State shared between the controller and the probe server
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn scrape(State(state): State<Arc<HealthState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, OPENMETRICS_TEXT)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(scrape))
        .with_state(state)
}

/// Port from `HEALTH_PORT`, falling back to the default when unset or invalid
pub fn health_port(value: Option<&str>) -> u16 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_HEALTH_PORT)
}

/// Serve probes and metrics on all interfaces until the listener fails
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "health server listening");
    axum::serve(listener, create_router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_series() {
        let metrics = Metrics::new();
        let crdb = ClusterLabels::new("default", "crdb");
        metrics.reconciled(&crdb, Duration::from_millis(500));
        metrics.reconcile_failed(&crdb);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"cockroach_operator_reconciliations_total{namespace="default",name="crdb"} 1"#));
        assert!(text.contains("cockroach_operator_reconciliation_errors_total"));
        assert!(text.contains("cockroach_operator_reconcile_duration_seconds_bucket"));
    }

    #[test]
    fn test_action_and_node_series() {
        let metrics = Metrics::new();
        metrics.action(ActionType::Deploy, ActionStatus::Finished);
        metrics.action(ActionType::Decommission, ActionStatus::Failed);
        metrics.nodes(&ClusterLabels::new("db", "crdb"), 5, 3);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"cockroach_operator_actions_total{action="Deploy",status="Finished"} 1"#));
        assert!(text.contains(r#"action="Decommission",status="Failed""#));
        assert!(text.contains(r#"cockroach_operator_cluster_nodes_desired{namespace="db",name="crdb"} 5"#));
        assert!(text.contains(r#"cockroach_operator_cluster_nodes_ready{namespace="db",name="crdb"} 3"#));
    }

    #[test]
    fn test_health_port() {
        assert_eq!(health_port(None), 8080);
        assert_eq!(health_port(Some(" 9090 ")), 9090);
        assert_eq!(health_port(Some("not-a-port")), 8080);
    }

    #[test]
    fn test_readiness_flag() {
        let state = HealthState::new();
        assert!(!state.is_ready());
        state.set_ready(true);
        assert!(state.is_ready());
        state.set_ready(false);
        assert!(!state.is_ready());
    }
}
