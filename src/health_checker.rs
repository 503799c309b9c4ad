//! Cluster health gate used between disruptive steps
//!
//! A probe waits until the stateful set serves all its replicas, then checks
//! that no store reports under-replicated ranges. The metric is read from
//! `_status/vars` inside every pod, highest ordinal first. Because a node can
//! still be evicted shortly after it turns ready, a quiescent cluster is
//! probed a second time after a short pause.

use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::controller::error::{BackoffConfig, is_retryable_kube_error};
use crate::resources::exec::{ExecError, exec_in_pod};
use crate::resources::statefulset::DB_CONTAINER_NAME;
use crate::scale::{ClusterScaler, CockroachStatefulSet, ScaleError};

/// Prefix of the metric line for one store
pub const UNDERREPLICATED_METRIC: &str = "ranges_underreplicated{store=";

const METRIC_MARKER: &str = "ranges_underreplicated{";

/// Longest time one metric wait may take
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Cap on the interval between metric checks
pub const PROBE_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Pause before the confirming second probe
pub const SECOND_PROBE_DELAY: Duration = Duration::from_secs(22);

#[derive(Error, Debug)]
pub enum HealthCheckError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("exec failed: {0}")]
    Exec(#[from] ExecError),

    #[error("statefulset is not ready: {0}")]
    NotReady(#[from] ScaleError),

    #[error("non existing ranges_underreplicated metric on {pod}")]
    MissingMetric { pod: String },

    #[error("incorrect format of the metric line {line:?}")]
    MalformedMetric { line: String },

    #[error("{pod} reports {value} under-replicated ranges")]
    UnderReplicated { pod: String, value: f64 },
}

impl HealthCheckError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HealthCheckError::Kube(e) => is_retryable_kube_error(e),
            HealthCheckError::Exec(e) => e.is_transport(),
            HealthCheckError::NotReady(e) => e.is_retryable(),
            HealthCheckError::MissingMetric { .. }
            | HealthCheckError::MalformedMetric { .. }
            | HealthCheckError::UnderReplicated { .. } => true,
        }
    }
}

/// First line of a `_status/vars` body that carries the metric
pub fn find_metric_line(body: &str) -> Option<&str> {
    body.lines().find(|line| line.contains(METRIC_MARKER))
}

/// Value of a `ranges_underreplicated{store="1"} 0` line
pub fn parse_underreplicated(line: &str) -> Result<f64, HealthCheckError> {
    let malformed = || HealthCheckError::MalformedMetric {
        line: line.to_string(),
    };
    if !line.starts_with(UNDERREPLICATED_METRIC) {
        return Err(malformed());
    }
    let mut parts = line.split(' ');
    let value = parts.nth(1).ok_or_else(malformed)?;
    value.trim().parse().map_err(|_| malformed())
}

/// Blocks until the cluster is safe to disrupt again
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `ordinal` only labels the log lines
    async fn probe(&self, ordinal: i32) -> Result<(), HealthCheckError>;
}

pub struct CockroachHealthChecker {
    client: Client,
    namespace: String,
    statefulset: String,
    http_port: i32,
    secure: bool,
    backoff: BackoffConfig,
}

impl CockroachHealthChecker {
    pub fn new(client: Client, cluster: &Cluster) -> Self {
        Self {
            client,
            namespace: cluster.namespace(),
            statefulset: cluster.statefulset_name(),
            http_port: cluster.http_port(),
            secure: cluster.is_secure(),
            backoff: BackoffConfig::polling(Duration::from_millis(500), PROBE_MAX_INTERVAL),
        }
    }

    fn vars_command(&self) -> Vec<String> {
        let (flags, scheme) = if self.secure { ("-sk", "https") } else { ("-s", "http") };
        vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            format!(
                "curl {flags} {scheme}://localhost:{}/_status/vars || true",
                self.http_port
            ),
        ]
    }

    async fn check_pod(&self, ordinal: i32) -> Result<(), HealthCheckError> {
        let pod = format!("{}-{ordinal}", self.statefulset);
        let output = exec_in_pod(
            &self.client,
            &self.namespace,
            &pod,
            DB_CONTAINER_NAME,
            self.vars_command(),
        )
        .await?;

        let line = find_metric_line(&output.stdout)
            .ok_or_else(|| HealthCheckError::MissingMetric { pod: pod.clone() })?;
        let value = match parse_underreplicated(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(%pod, %line, "health check failed, unexpected metric format");
                return Err(e);
            }
        };
        debug!(%pod, value, "ranges_underreplicated");
        if value > 0.0 {
            return Err(HealthCheckError::UnderReplicated { pod, value });
        }
        Ok(())
    }

    async fn check_all_pods(&self, replicas: i32) -> Result<(), HealthCheckError> {
        for ordinal in (0..replicas).rev() {
            self.check_pod(ordinal).await?;
        }
        Ok(())
    }

    async fn wait_until_quiescent(&self, replicas: i32) -> Result<(), HealthCheckError> {
        self.backoff
            .retry(
                PROBE_TIMEOUT,
                || self.check_all_pods(replicas),
                HealthCheckError::is_retryable,
            )
            .await
    }
}

#[async_trait]
impl HealthChecker for CockroachHealthChecker {
    async fn probe(&self, ordinal: i32) -> Result<(), HealthCheckError> {
        debug!(statefulset = %self.statefulset, ordinal, "health check probe");
        let sts = CockroachStatefulSet::new(
            self.client.clone(),
            self.namespace.clone(),
            self.statefulset.clone(),
        );
        let replicas = sts.replicas().await?;
        sts.wait_until_healthy(replicas).await?;

        self.wait_until_quiescent(replicas).await?;
        tokio::time::sleep(SECOND_PROBE_DELAY).await;
        debug!(statefulset = %self.statefulset, ordinal, "second under-replication probe");
        self.wait_until_quiescent(replicas).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &str = "# HELP ranges_underreplicated Number of ranges with fewer live replicas than the replication target
# TYPE ranges_underreplicated gauge
ranges_underreplicated{store=\"1\"} 0
ranges_unavailable{store=\"1\"} 0
";

    #[test]
    fn test_find_metric_line_skips_help() {
        assert_eq!(find_metric_line(VARS), Some("ranges_underreplicated{store=\"1\"} 0"));
        assert_eq!(find_metric_line("sys_uptime 10\n"), None);
    }

    #[test]
    fn test_parse_underreplicated() {
        assert_eq!(parse_underreplicated("ranges_underreplicated{store=\"3\"} 0").unwrap(), 0.0);
        assert_eq!(parse_underreplicated("ranges_underreplicated{store=\"3\"} 12").unwrap(), 12.0);
        assert_eq!(parse_underreplicated("ranges_underreplicated{store=\"3\"} 1e+00").unwrap(), 1.0);
    }

    #[test]
    fn test_malformed_metric_is_retryable() {
        for line in ["ranges_underreplicated{store=\"1\"}", "other{store=\"1\"} 0", "ranges_underreplicated{store=\"1\"} x"] {
            let err = parse_underreplicated(line).unwrap_err();
            assert!(matches!(err, HealthCheckError::MalformedMetric { .. }), "{line}");
            assert!(err.is_retryable());
        }
    }
}
