//! Graceful horizontal scaling of the database stateful set
//!
//! [`Scaler::ensure_scale`] moves the replica count one step at a time:
//! scale down decommissions the highest ordinal before removing its pod,
//! scale up waits for every new pod to run and turn healthy before adding the
//! next. Unused volume claims are pruned before and after, since a claim left
//! over from a decommissioned node must never be reused.

pub mod drainer;
pub mod pvc_pruner;
pub mod statefulset;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::controller::error::is_retryable_kube_error;
use crate::resources::cluster_sql::ClusterSqlError;
use crate::resources::database::DbError;
use crate::resources::exec::ExecError;

pub use drainer::CockroachNodeDrainer;
pub use pvc_pruner::{DisabledPruner, PersistentVolumePruner};
pub use statefulset::CockroachStatefulSet;

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("exec failed: {0}")]
    Exec(#[from] ExecError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("cluster setting error: {0}")]
    ClusterSql(#[from] ClusterSqlError),

    #[error("{0}")]
    NotReady(String),

    #[error("statefulset {name} has no replica count")]
    MissingReplicas { name: String },

    #[error("could not find the node id of {host}")]
    NodeNotFound { host: String },

    #[error("unexpected node status for node {node_id}")]
    UnexpectedNodeStatus { node_id: u64 },

    #[error("unexpected CLI output: {0}")]
    MalformedOutput(String),

    #[error("decommissioning has stalled: node {node_id} kept {replicas} replicas for {timeout:?}")]
    DecommissionStalled {
        node_id: u64,
        replicas: u64,
        timeout: Duration,
    },

    #[error("concurrent statefulset modification detected on {name}: {reason}")]
    ConcurrentModification { name: String, reason: String },
}

pub type ScaleResult<T> = Result<T, ScaleError>;

impl ScaleError {
    /// Whether a polling loop should try again
    pub fn is_retryable(&self) -> bool {
        match self {
            ScaleError::Kube(e) => is_retryable_kube_error(e),
            ScaleError::Exec(e) => e.is_transport(),
            ScaleError::NotReady(_) => true,
            ScaleError::UnexpectedNodeStatus { .. } => true,
            _ => false,
        }
    }
}

/// Replica control over the stateful set
#[async_trait]
pub trait ClusterScaler: Send + Sync {
    async fn replicas(&self) -> ScaleResult<i32>;
    async fn set_replicas(&self, replicas: i32) -> ScaleResult<()>;
    /// Every requested pod is scheduled and running
    async fn wait_until_running(&self) -> ScaleResult<()>;
    /// Exactly `replicas` pods report ready
    async fn wait_until_healthy(&self, replicas: i32) -> ScaleResult<()>;
}

/// Moves all data off the node at an ordinal
#[async_trait]
pub trait Drainer: Send + Sync {
    async fn decommission(&self, ordinal: i32) -> ScaleResult<()>;
}

/// Deletes claims no pod uses
#[async_trait]
pub trait PvcPruner: Send + Sync {
    async fn prune(&self) -> ScaleResult<()>;
}

pub struct Scaler<'a> {
    pub crdb: &'a dyn ClusterScaler,
    pub drainer: &'a dyn Drainer,
    pub pruner: &'a dyn PvcPruner,
}

impl Scaler<'_> {
    /// Add or remove replicas one at a time until `scale` are running
    pub async fn ensure_scale(&self, scale: i32) -> ScaleResult<()> {
        // Old clusters may still carry claims from removed nodes
        self.pruner.prune().await?;

        let mut current = self.crdb.replicas().await?;

        while current > scale {
            let next = current - 1;
            info!(have = current, want = next, "scaling down statefulset");
            self.drainer.decommission(next).await?;
            self.crdb.set_replicas(next).await?;
            self.crdb.wait_until_healthy(next).await?;
            current = self.crdb.replicas().await?;
        }

        // One pod at a time keeps zone spreading and node ids predictable
        while current < scale {
            let next = current + 1;
            info!(have = current, want = next, "scaling up statefulset");
            self.crdb.set_replicas(next).await?;
            self.crdb.wait_until_running().await?;
            self.crdb.wait_until_healthy(next).await?;
            current = self.crdb.replicas().await?;
        }

        self.pruner.prune().await
    }
}
