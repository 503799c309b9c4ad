//! Operator actions
//!
//! Each action is a unit struct implementing [`Actor`]. The director picks at
//! most one [`ActionType`] per reconcile and [`actor_for`] maps it to its
//! handler. Actions report failures as an [`ActorError`] whose class tells
//! the reconcile loop whether to requeue and whether to mark the action
//! failed.

pub mod cluster_restart;
pub mod decommission;
pub mod deploy;
pub mod expose_ingress;
pub mod generate_cert;
pub mod initialize;
pub mod partitioned_update;
pub mod resize_pvc;
pub mod setup_rbac;
pub mod version_check;

use async_trait::async_trait;
use thiserror::Error;

use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::controller::error::{is_kube_not_found, is_retryable_kube_error};
use crate::crd::ActionType;
use crate::features::Feature;
use crate::health_checker::HealthCheckError;
use crate::resources::ResourceError;
use crate::resources::cluster_sql::ClusterSqlError;
use crate::resources::database::DbError;
use crate::resources::exec::ExecError;
use crate::scale::{DisabledPruner, PersistentVolumePruner, PvcPruner, ScaleError};
use crate::security::certs::CertError;
use crate::update::UpdateError;

pub use version_check::VersionError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of one action, classified for the reconcile loop
#[derive(Error, Debug)]
pub enum ActorError {
    /// A precondition is not met yet; retry shortly, do not mark failed
    #[error("not ready: {message}")]
    NotReady {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// I/O hiccup or write conflict; retry with backoff
    #[error("{message}")]
    Transient {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The user must change the resource
    #[error("{message}")]
    Validation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Retrying cannot help
    #[error("{message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

pub type ActorResult<T> = Result<T, ActorError>;

impl ActorError {
    pub fn not_ready(message: impl Into<String>) -> Self {
        ActorError::NotReady {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ActorError::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ActorError::Validation {
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ActorError::Permanent {
            message: message.into(),
            source: None,
        }
    }

    fn not_ready_from<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        ActorError::NotReady {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    fn transient_from<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        ActorError::Transient {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    fn validation_from<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        ActorError::Validation {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    fn permanent_from<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        ActorError::Permanent {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    /// Whether the reconcile loop should try the action again on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActorError::NotReady { .. } | ActorError::Transient { .. })
    }

    /// Whether the action must be recorded as failed
    pub fn is_failure(&self) -> bool {
        !self.is_retryable()
    }

    pub fn message(&self) -> &str {
        match self {
            ActorError::NotReady { message, .. }
            | ActorError::Transient { message, .. }
            | ActorError::Validation { message, .. }
            | ActorError::Permanent { message, .. } => message,
        }
    }
}

impl From<kube::Error> for ActorError {
    fn from(e: kube::Error) -> Self {
        if is_kube_not_found(&e) {
            ActorError::not_ready_from(e)
        } else if is_retryable_kube_error(&e) {
            ActorError::transient_from(e)
        } else {
            ActorError::permanent_from(e)
        }
    }
}

impl From<ResourceError> for ActorError {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::Kube(e) => e.into(),
            ResourceError::InvalidSpec { .. } => ActorError::validation_from(e),
            ResourceError::Serialization(_) => ActorError::permanent_from(e),
        }
    }
}

impl From<ExecError> for ActorError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::KubeError(e) => e.into(),
            other => ActorError::transient_from(other),
        }
    }
}

impl From<DbError> for ActorError {
    fn from(e: DbError) -> Self {
        ActorError::transient_from(e)
    }
}

impl From<ClusterSqlError> for ActorError {
    fn from(e: ClusterSqlError) -> Self {
        match e {
            ClusterSqlError::InvalidSettingName(_) => ActorError::permanent_from(e),
            other => ActorError::transient_from(other),
        }
    }
}

impl From<CertError> for ActorError {
    fn from(e: CertError) -> Self {
        match e {
            CertError::InvalidSan { .. } => ActorError::validation_from(e),
            other => ActorError::permanent_from(other),
        }
    }
}

impl From<HealthCheckError> for ActorError {
    fn from(e: HealthCheckError) -> Self {
        match e {
            HealthCheckError::Kube(e) => e.into(),
            HealthCheckError::NotReady(e) => e.into(),
            other if other.is_retryable() => ActorError::transient_from(other),
            other => ActorError::permanent_from(other),
        }
    }
}

impl From<ScaleError> for ActorError {
    fn from(e: ScaleError) -> Self {
        match e {
            ScaleError::Kube(e) => e.into(),
            ScaleError::Exec(e) => e.into(),
            ScaleError::Db(e) => e.into(),
            ScaleError::ClusterSql(e) => e.into(),
            ScaleError::NotReady(_) | ScaleError::MissingReplicas { .. } => {
                ActorError::not_ready_from(e)
            }
            ScaleError::DecommissionStalled { .. } => ActorError::permanent_from(e),
            other => ActorError::transient_from(other),
        }
    }
}

impl From<UpdateError> for ActorError {
    fn from(e: UpdateError) -> Self {
        match e {
            UpdateError::Kube(e) => e.into(),
            UpdateError::Db(e) => e.into(),
            UpdateError::ClusterSql(e) => e.into(),
            UpdateError::HealthCheck(e) => e.into(),
            UpdateError::Scale(e) => e.into(),
            UpdateError::NotReady(_) | UpdateError::MissingReplicas { .. } => {
                ActorError::not_ready_from(e)
            }
            UpdateError::InvalidVersion { .. }
            | UpdateError::InvalidPreserveDowngrade(_)
            | UpdateError::NotAllowed { .. } => ActorError::validation_from(e),
            UpdateError::ContainerNotFound { .. }
            | UpdateError::PodTimeout { .. }
            | UpdateError::ImagePull { .. } => ActorError::permanent_from(e),
        }
    }
}

/// One operator procedure
#[async_trait]
pub trait Actor: Send + Sync {
    fn action_type(&self) -> ActionType;

    /// Run the action against the latest copy of the cluster. Condition and
    /// status changes are made on `cluster` and persisted by the caller.
    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()>;
}

/// Claim pruner honouring the AutoPrunePVC gate
pub(crate) fn pruner_for(ctx: &Context, cluster: &Cluster) -> Box<dyn PvcPruner> {
    if ctx.config.features.enabled(Feature::AutoPrunePvc) {
        Box::new(PersistentVolumePruner::new(
            ctx.client.clone(),
            cluster.namespace(),
            cluster.statefulset_name(),
        ))
    } else {
        Box::new(DisabledPruner)
    }
}

/// Handler for an action picked by the director
pub fn actor_for(action: ActionType) -> &'static dyn Actor {
    match action {
        ActionType::ClusterRestart => &cluster_restart::ClusterRestart,
        ActionType::SetupRbac => &setup_rbac::SetupRbac,
        ActionType::Decommission => &decommission::Decommission,
        ActionType::VersionCheck => &version_check::VersionCheck,
        ActionType::GenerateCert => &generate_cert::GenerateCert,
        ActionType::PartitionedUpdate => &partitioned_update::PartitionedUpdate,
        ActionType::ResizePvc => &resize_pvc::ResizePvc,
        ActionType::Deploy => &deploy::Deploy,
        ActionType::Initialize => &initialize::Initialize,
        ActionType::ExposeIngress => &expose_ingress::ExposeIngress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_dispatch_covers_every_action() {
        for action in ActionType::ALL {
            assert_eq!(actor_for(action).action_type(), action);
        }
    }

    #[test]
    fn test_kube_errors() {
        assert!(matches!(ActorError::from(api_error(409)), ActorError::Transient { .. }));
        assert!(matches!(ActorError::from(api_error(503)), ActorError::Transient { .. }));
        assert!(matches!(ActorError::from(api_error(404)), ActorError::NotReady { .. }));
        assert!(matches!(ActorError::from(api_error(403)), ActorError::Permanent { .. }));
    }

    #[test]
    fn test_stalled_decommission_is_permanent() {
        let err = ActorError::from(ScaleError::DecommissionStalled {
            node_id: 5,
            replicas: 42,
            timeout: Duration::from_secs(90),
        });
        assert!(matches!(err, ActorError::Permanent { .. }));
        assert!(err.is_failure());
        assert!(err.message().contains("stalled"));
    }

    #[test]
    fn test_update_errors() {
        let not_allowed = ActorError::from(UpdateError::NotAllowed {
            current: "23.2.0".into(),
            want: "24.1.0".into(),
            preserve: "22.2".into(),
            reason: "can't roll forward due to preserve downgrade option".into(),
        });
        assert!(matches!(not_allowed, ActorError::Validation { .. }));
        assert!(not_allowed.message().contains("preserve downgrade option"));

        let pull = ActorError::from(UpdateError::ImagePull {
            pod: "crdb-2".into(),
            reason: "ImagePullBackOff".into(),
        });
        assert!(matches!(pull, ActorError::Permanent { .. }));

        let waiting = ActorError::from(UpdateError::NotReady("statefulset is updating".into()));
        assert!(waiting.is_retryable());
    }

    #[test]
    fn test_source_is_kept() {
        use std::error::Error as _;
        let err = ActorError::from(ScaleError::NotReady("3 of 4 pods running".into()));
        assert!(err.source().is_some());
        assert!(ActorError::not_ready("waiting").source().is_none());
    }
}
