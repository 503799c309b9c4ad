//! Command execution inside database pods
//!
//! Runs a command through the pod exec sub-resource (multiplexed websocket
//! streams) and collects its output. Used by the drainer, the health checker
//! and anything else that needs the `cockroach` CLI shipped in the image.

use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("IO error on exec stream: {0}")]
    IoError(#[from] std::io::Error),

    #[error("exec stream {0} not available")]
    StreamUnavailable(&'static str),

    #[error("command {command:?} in {pod} failed: {message}")]
    CommandFailed {
        pod: String,
        command: String,
        message: String,
        stdout: String,
        stderr: String,
    },
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Collected output of one command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` in `container` of `pod` and wait for it to exit
pub async fn exec_in_pod(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: &str,
    command: Vec<String>,
) -> ExecResult<ExecOutput> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let attach_params = AttachParams {
        container: Some(container.to_string()),
        stdin: false,
        stdout: true,
        stderr: true,
        tty: false,
        ..Default::default()
    };

    debug!(pod = %pod, namespace = %namespace, command = ?command, "exec in pod");
    let printable = command.join(" ");
    let mut attached = pods.exec(pod, command, &attach_params).await?;

    let stdout = attached
        .stdout()
        .ok_or(ExecError::StreamUnavailable("stdout"))?;
    let stderr = attached
        .stderr()
        .ok_or(ExecError::StreamUnavailable("stderr"))?;

    // Drain both streams together so a chatty stderr cannot block stdout
    let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;

    let status = attached
        .take_status()
        .ok_or(ExecError::StreamUnavailable("status"))?;

    if let Some(status) = status.await
        && status.status.as_deref() != Some("Success")
    {
        let message = status
            .message
            .clone()
            .unwrap_or_else(|| format!("{:?}", status.reason));
        return Err(ExecError::CommandFailed {
            pod: pod.to_string(),
            command: printable,
            message,
            stdout,
            stderr,
        });
    }

    Ok(ExecOutput { stdout, stderr })
}

async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}

impl ExecError {
    /// Whether the failure came from the transport rather than the command
    pub fn is_transport(&self) -> bool {
        !matches!(self, ExecError::CommandFailed { .. })
    }
}
