//! Dialing database pods through the port-forward sub-resource
//!
//! When the operator runs outside the managed cluster, pod DNS names do not
//! resolve. [`PodDialer`] opens a port-forward channel to the pod instead and
//! hands back a byte stream a SQL driver can speak over.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use k8s_openapi::api::core::v1::Pod;
use kube::api::Portforwarder;
use kube::{Api, Client};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DialError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("network {0:?} is not supported, only tcp")]
    UnsupportedNetwork(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("port-forward to {pod} did not provide a data stream")]
    NoStream { pod: String },
}

/// Pod name and port parsed from a `host:port` address whose host is a pod
/// DNS name (`<pod>.<service>.<namespace>`)
pub fn parse_pod_address(addr: &str) -> Result<(String, u16), DialError> {
    let invalid = || DialError::InvalidAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let pod = host.split('.').next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
    Ok((pod.to_string(), port))
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Opens connections to pods in one namespace
#[derive(Clone)]
pub struct PodDialer {
    client: Client,
    namespace: String,
}

impl PodDialer {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Dial `addr` over `network`; only `tcp` is accepted
    pub async fn dial(&self, network: &str, addr: &str) -> Result<PodStream, DialError> {
        if !network.eq_ignore_ascii_case("tcp") {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }
        let (pod, port) = parse_pod_address(addr)?;
        self.dial_pod(&pod, port).await
    }

    pub async fn dial_pod(&self, pod: &str, port: u16) -> Result<PodStream, DialError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        debug!(pod = %pod, port = port, namespace = %self.namespace, "opening port-forward");

        let mut forwarder = pods.portforward(pod, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| DialError::NoStream {
                pod: pod.to_string(),
            })?;

        // The error sub-stream carries failures of the remote connection;
        // surface them as a closed connection on the data stream
        let (error_tx, error_rx) = watch::channel(None);
        if let Some(errors) = forwarder.take_error(port) {
            let pod = pod.to_string();
            tokio::spawn(async move {
                if let Some(message) = errors.await {
                    warn!(pod = %pod, error = %message, "port-forward error");
                    let _ = error_tx.send(Some(message));
                }
            });
        }

        Ok(PodStream {
            inner: Box::new(stream),
            error: error_rx,
            _forwarder: forwarder,
        })
    }
}

/// Data stream of one port-forward channel
///
/// Dropping it closes the channel.
pub struct PodStream {
    inner: Box<dyn Io>,
    error: watch::Receiver<Option<String>>,
    _forwarder: Portforwarder,
}

impl PodStream {
    fn remote_error(&self) -> Option<io::Error> {
        self.error
            .borrow()
            .as_ref()
            .map(|message| io::Error::new(io::ErrorKind::ConnectionAborted, message.clone()))
    }
}

impl AsyncRead for PodStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(err) = self.remote_error() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PodStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.remote_error() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pod_address() {
        assert_eq!(
            parse_pod_address("crdb-0.crdb.db:26257").unwrap(),
            ("crdb-0".to_string(), 26257)
        );
        assert_eq!(
            parse_pod_address("crdb-2:8080").unwrap(),
            ("crdb-2".to_string(), 8080)
        );
    }

    #[test]
    fn test_parse_pod_address_rejects_garbage() {
        assert!(matches!(
            parse_pod_address("crdb-0.crdb.db"),
            Err(DialError::InvalidAddress(_))
        ));
        assert!(parse_pod_address(":26257").is_err());
        assert!(parse_pod_address("crdb-0:http").is_err());
    }
}
