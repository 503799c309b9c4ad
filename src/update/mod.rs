//! Ordinal-by-ordinal replacement of database pods
//!
//! [`partitioned::PartitionedUpdater`] drives the stateful set's rolling
//! update partition from the highest ordinal down to zero and verifies every
//! pod before it moves on. Version upgrades and rolling restarts are both
//! expressed as a template mutation plus a per-pod verification target.

pub mod partitioned;
pub mod rolling_restart;
pub mod version;

use std::time::Duration;

use semver::Version;
use thiserror::Error;

use crate::controller::error::is_retryable_kube_error;
use crate::health_checker::HealthCheckError;
use crate::resources::cluster_sql::ClusterSqlError;
use crate::resources::database::DbError;
use crate::scale::ScaleError;

pub use partitioned::{PartitionedUpdater, PodTarget, is_updating, verify_pod};
pub use version::{UpdateKind, classify, parse_version};

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("cluster setting error: {0}")]
    ClusterSql(#[from] ClusterSqlError),

    #[error("health check failed: {0}")]
    HealthCheck(#[from] HealthCheckError),

    #[error("scale error: {0}")]
    Scale(#[from] ScaleError),

    #[error("invalid version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("invalid preserve downgrade option {0:?}")]
    InvalidPreserveDowngrade(String),

    #[error(
        "upgrading from {current} to {want} with preserve downgrade option set to {preserve} not allowed: {reason}"
    )]
    NotAllowed {
        current: String,
        want: String,
        preserve: String,
        reason: String,
    },

    #[error("cockroachdb container not found in sts {statefulset}")]
    ContainerNotFound { statefulset: String },

    #[error("statefulset {name} has no replica count")]
    MissingReplicas { name: String },

    #[error("{0}")]
    NotReady(String),

    #[error("pod {pod} was not updated within {timeout:?}")]
    PodTimeout { pod: String, timeout: Duration },

    #[error("pod {pod} cannot pull its image: {reason}")]
    ImagePull { pod: String, reason: String },
}

pub type UpdateResult<T> = Result<T, UpdateError>;

impl UpdateError {
    pub fn not_allowed(
        current: &Version,
        want: &Version,
        preserve: Option<version::MajorVersion>,
        reason: &str,
    ) -> Self {
        UpdateError::NotAllowed {
            current: current.to_string(),
            want: want.to_string(),
            preserve: preserve.map(|p| p.to_string()).unwrap_or_default(),
            reason: reason.to_string(),
        }
    }

    /// Whether a wait loop should poll again
    pub fn is_retryable(&self) -> bool {
        match self {
            UpdateError::Kube(e) => is_retryable_kube_error(e),
            UpdateError::HealthCheck(e) => e.is_retryable(),
            UpdateError::Scale(e) => e.is_retryable(),
            UpdateError::NotReady(_) => true,
            _ => false,
        }
    }
}
