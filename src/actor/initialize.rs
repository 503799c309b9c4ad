//! One-time `cockroach init` against the first node

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tracing::info;

use crate::actor::{Actor, ActorError, ActorResult};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::crd::{ActionType, ConditionType};
use crate::resources::exec::{ExecError, exec_in_pod};
use crate::resources::statefulset::DB_CONTAINER_NAME;

const ALREADY_INITIALIZED: &str = "cluster has already been initialized";
const NOT_SCHEDULED: [&str; 2] = ["container not found", "does not have a host assigned"];

/// What a failed `init` means for the action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitFailure {
    /// A previous run got through; treat as success
    AlreadyInitialized,
    /// The pod is not up yet
    NotScheduled,
    Other,
}

pub fn classify_init_failure(text: &str) -> InitFailure {
    if text.contains(ALREADY_INITIALIZED) {
        InitFailure::AlreadyInitialized
    } else if NOT_SCHEDULED.iter().any(|s| text.contains(s)) {
        InitFailure::NotScheduled
    } else {
        InitFailure::Other
    }
}

fn failure_text(e: &ExecError) -> String {
    match e {
        ExecError::CommandFailed {
            message,
            stdout,
            stderr,
            ..
        } => format!("{message}\n{stdout}\n{stderr}"),
        other => other.to_string(),
    }
}

pub fn init_command(cluster: &Cluster) -> Vec<String> {
    vec![
        "/cockroach/cockroach.sh".to_string(),
        "init".to_string(),
        cluster.secure_mode(),
        format!("--host=localhost:{}", cluster.grpc_port()),
    ]
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

pub struct Initialize;

#[async_trait]
impl Actor for Initialize {
    fn action_type(&self) -> ActionType {
        ActionType::Initialize
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let ns = cluster.namespace();
        let pod_name = format!("{}-0", cluster.statefulset_name());
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
        match pods.get_opt(&pod_name).await? {
            Some(pod) if is_running(&pod) => {}
            _ => return Err(ActorError::not_ready(format!("pod {pod_name} is not running"))),
        }

        let result = exec_in_pod(
            &ctx.client,
            &ns,
            &pod_name,
            DB_CONTAINER_NAME,
            init_command(cluster),
        )
        .await;
        if let Err(e) = result {
            match classify_init_failure(&failure_text(&e)) {
                InitFailure::AlreadyInitialized => {
                    info!(pod = %pod_name, "cluster was already initialized");
                }
                InitFailure::NotScheduled => {
                    return Err(ActorError::NotReady {
                        message: format!("pod {pod_name} is not ready for init"),
                        source: Some(Box::new(e)),
                    });
                }
                InitFailure::Other => return Err(e.into()),
            }
        } else {
            info!(pod = %pod_name, "initialized cluster");
        }

        cluster.set_true(ConditionType::Initialized);
        Ok(())
    }
}
