//! Secrets holding cluster certificates
//!
//! Node and client secrets carry `ca.crt`, `tls.crt` and `tls.key`; the CA
//! secret carries `ca.crt` and `ca.key`.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use tracing::info;

use crate::cluster::Cluster;
use crate::resources::common::owner_reference;

pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";
pub const CERT_KEY: &str = "tls.crt";
pub const KEY_KEY: &str = "tls.key";
pub const PKCS8_KEY_KEY: &str = "tls.key.pk8";

const CERT_KEYS: [&str; 3] = [CA_CERT_KEY, CERT_KEY, KEY_KEY];
const CA_KEYS: [&str; 2] = [CA_CERT_KEY, CA_KEY_KEY];

/// Decoded contents of one certificate secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSecret {
    pub name: String,
    data: BTreeMap<String, Vec<u8>>,
}

impl TlsSecret {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn from_secret(secret: &Secret) -> Self {
        Self {
            name: secret.name_any(),
            data: secret
                .data
                .as_ref()
                .map(|d| d.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
                .unwrap_or_default(),
        }
    }

    /// Read a secret, `None` when it does not exist
    pub async fn load(client: &Client, namespace: &str, name: &str) -> Result<Option<Self>, kube::Error> {
        let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(Self::from_secret))
    }

    fn has_all(&self, keys: &[&str]) -> bool {
        keys.iter()
            .all(|k| self.data.get(*k).is_some_and(|v| !v.is_empty()))
    }

    /// Node or client secret with certificate, key and CA present
    pub fn is_ready(&self) -> bool {
        self.has_all(&CERT_KEYS)
    }

    /// CA secret with certificate and key present
    pub fn is_ready_ca(&self) -> bool {
        self.has_all(&CA_KEYS)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) -> &mut Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn ca_cert(&self) -> Option<&str> {
        self.get_str(CA_CERT_KEY)
    }

    pub fn cert(&self) -> Option<&str> {
        self.get_str(CERT_KEY)
    }

    /// Secret object owned by the cluster
    pub fn to_secret(&self, cluster: &Cluster) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(cluster.namespace()),
                labels: Some(cluster.labels()),
                owner_references: Some(vec![owner_reference(cluster.object())]),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                self.data
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Create the secret, or replace the data of an existing one
    pub async fn save(&self, client: &Client, cluster: &Cluster) -> Result<(), kube::Error> {
        let api: Api<Secret> = Api::namespaced(client.clone(), &cluster.namespace());
        let mut desired = self.to_secret(cluster);
        match api.get_opt(&self.name).await? {
            None => {
                api.create(&PostParams::default(), &desired).await?;
                info!(secret = %self.name, "created certificate secret");
            }
            Some(existing) => {
                desired.metadata.resource_version = existing.resource_version();
                api.replace(&self.name, &PostParams::default(), &desired)
                    .await?;
                info!(secret = %self.name, "updated certificate secret");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness() {
        let mut secret = TlsSecret::new("crdb-node");
        assert!(!secret.is_ready());
        secret
            .set(CA_CERT_KEY, "ca")
            .set(CERT_KEY, "cert")
            .set(KEY_KEY, "");
        assert!(!secret.is_ready());
        secret.set(KEY_KEY, "key");
        assert!(secret.is_ready());
        assert!(!secret.is_ready_ca());
        secret.set(CA_KEY_KEY, "ca-key");
        assert!(secret.is_ready_ca());
    }

    #[test]
    fn test_from_secret_decodes_data() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("crdb-root".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CERT_KEY.to_string(),
                ByteString(b"-----BEGIN CERTIFICATE-----".to_vec()),
            )])),
            ..Default::default()
        };
        let tls = TlsSecret::from_secret(&secret);
        assert_eq!(tls.name, "crdb-root");
        assert_eq!(tls.cert(), Some("-----BEGIN CERTIFICATE-----"));
        assert_eq!(tls.ca_cert(), None);
    }
}
