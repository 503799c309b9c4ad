//! SQL connections to a managed cluster
//!
//! Connects as `root` to the `system` database. Inside the platform the
//! public service is dialled directly; outside it the first pod is reached
//! through [`PodDialer`]. Secure clusters use the root client certificate
//! and verify the server against the cluster CA.

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_postgres::config::SslMode;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Config, NoTls};
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, trace};

use crate::cluster::Cluster;
use crate::resources::port_forward::{PodDialer, PodStream};

pub const DATABASE: &str = "system";
pub const ROOT_USER: &str = "root";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to load client certificates from secret {secret}: {reason}")]
    CertLoad { secret: String, reason: String },

    #[error("failed to dial {host}: {source}")]
    Dial {
        host: String,
        #[source]
        source: BoxError,
    },

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("connection probe failed: {0}")]
    Probe(#[source] tokio_postgres::Error),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// PEM material of the root client secret
#[derive(Clone, Debug)]
pub struct ClientCertificates {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl ClientCertificates {
    pub fn from_secret(secret: &Secret) -> DbResult<Self> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let data = secret.data.as_ref().ok_or_else(|| DbError::CertLoad {
            secret: name.clone(),
            reason: "secret has no data".to_string(),
        })?;
        let field = |key: &str| -> DbResult<String> {
            let bytes = data.get(key).ok_or_else(|| DbError::CertLoad {
                secret: name.clone(),
                reason: format!("missing key {key}"),
            })?;
            String::from_utf8(bytes.0.clone()).map_err(|_| DbError::CertLoad {
                secret: name.clone(),
                reason: format!("key {key} is not valid UTF-8"),
            })
        };
        Ok(Self {
            ca: field("ca.crt")?,
            cert: field("tls.crt")?,
            key: field("tls.key")?,
        })
    }
}

/// How to reach the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Pod to port-forward to when the operator runs outside the platform
    pub via_pod: Option<String>,
}

impl Endpoint {
    pub fn for_cluster(cluster: &Cluster, in_cluster: bool) -> Self {
        let port = u16::try_from(cluster.sql_port()).unwrap_or(26257);
        if in_cluster {
            Self {
                host: format!("{}.{}", cluster.public_service_name(), cluster.namespace()),
                port,
                via_pod: None,
            }
        } else {
            Self {
                host: cluster.pod_host(0),
                port,
                via_pod: Some(format!("{}-0", cluster.statefulset_name())),
            }
        }
    }
}

/// Connection parameters without the transport
pub fn connection_config(endpoint: &Endpoint, secure: bool) -> Config {
    let mut config = Config::new();
    config
        .host(&endpoint.host)
        .port(endpoint.port)
        .user(ROOT_USER)
        .dbname(DATABASE)
        .connect_timeout(CONNECT_TIMEOUT)
        .ssl_mode(if secure {
            SslMode::Require
        } else {
            SslMode::Disable
        });
    config
}

fn parse_certificates(pem: &str) -> DbResult<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DbError::TlsConfig(format!("failed to parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(DbError::TlsConfig(
            "no certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> DbResult<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| DbError::TlsConfig(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| DbError::TlsConfig("no private key found in PEM data".to_string()))
}

/// Verify-full TLS with the root client certificate
pub fn build_tls_connector(certs: &ClientCertificates) -> DbResult<MakeRustlsConnect> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in parse_certificates(&certs.ca)? {
        roots
            .add(cert)
            .map_err(|e| DbError::TlsConfig(format!("failed to add CA certificate: {e}")))?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(parse_certificates(&certs.cert)?, parse_private_key(&certs.key)?)
        .map_err(|e| DbError::TlsConfig(e.to_string()))?;

    Ok(MakeRustlsConnect::new(config))
}

/// An open, probed SQL connection
pub struct DbConnection {
    client: tokio_postgres::Client,
}

impl DbConnection {
    /// Connect to `cluster` and check the connection with `SELECT 1`
    pub async fn connect(client: &Client, cluster: &Cluster, in_cluster: bool) -> DbResult<Self> {
        let endpoint = Endpoint::for_cluster(cluster, in_cluster);
        let config = connection_config(&endpoint, cluster.is_secure());

        let tls = if cluster.is_secure() {
            let secret_name = cluster.client_tls_secret_name();
            let secrets: Api<Secret> = Api::namespaced(client.clone(), &cluster.namespace());
            let secret = secrets
                .get(&secret_name)
                .await
                .map_err(|e| DbError::CertLoad {
                    secret: secret_name.clone(),
                    reason: e.to_string(),
                })?;
            Some(build_tls_connector(&ClientCertificates::from_secret(&secret)?)?)
        } else {
            None
        };

        let db = match &endpoint.via_pod {
            None => Self::connect_direct(&config, &endpoint, tls).await?,
            Some(pod) => {
                let dialer = PodDialer::new(client.clone(), cluster.namespace());
                Self::connect_forwarded(&dialer, pod, &config, &endpoint, tls).await?
            }
        };

        db.client.simple_query("SELECT 1").await.map_err(DbError::Probe)?;
        debug!(host = %endpoint.host, "SQL connection established");
        Ok(db)
    }

    async fn connect_direct(
        config: &Config,
        endpoint: &Endpoint,
        tls: Option<MakeRustlsConnect>,
    ) -> DbResult<Self> {
        let dial_error = |e: tokio_postgres::Error| DbError::Dial {
            host: endpoint.host.clone(),
            source: Box::new(e),
        };
        let client = match tls {
            Some(tls) => {
                let (client, connection) = config.connect(tls).await.map_err(dial_error)?;
                spawn_connection(connection);
                client
            }
            None => {
                let (client, connection) = config.connect(NoTls).await.map_err(dial_error)?;
                spawn_connection(connection);
                client
            }
        };
        Ok(Self { client })
    }

    async fn connect_forwarded(
        dialer: &PodDialer,
        pod: &str,
        config: &Config,
        endpoint: &Endpoint,
        tls: Option<MakeRustlsConnect>,
    ) -> DbResult<Self> {
        let dial_error = |e: BoxError| DbError::Dial {
            host: endpoint.host.clone(),
            source: e,
        };
        let stream = dialer
            .dial_pod(pod, endpoint.port)
            .await
            .map_err(|e| dial_error(Box::new(e)))?;

        let client = match tls {
            Some(mut tls) => {
                let connector =
                    <MakeRustlsConnect as MakeTlsConnect<PodStream>>::make_tls_connect(
                        &mut tls,
                        &endpoint.host,
                    )
                    .map_err(|e| DbError::TlsConfig(e.to_string()))?;
                let (client, connection) = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    config.connect_raw(stream, connector),
                )
                .await
                .map_err(|e| dial_error(Box::new(e)))?
                .map_err(|e| dial_error(Box::new(e)))?;
                spawn_connection(connection);
                client
            }
            None => {
                let (client, connection) =
                    tokio::time::timeout(CONNECT_TIMEOUT, config.connect_raw(stream, NoTls))
                        .await
                        .map_err(|e| dial_error(Box::new(e)))?
                        .map_err(|e| dial_error(Box::new(e)))?;
                spawn_connection(connection);
                client
            }
        };
        Ok(Self { client })
    }

    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

fn spawn_connection<F>(connection: F)
where
    F: std::future::Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!(error = %e, "SQL connection closed");
        }
    });
}
