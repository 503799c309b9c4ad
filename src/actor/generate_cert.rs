//! Certificates for operator-managed TLS
//!
//! The CA is kept in `<cluster>-ca` and reused while it is complete. Node and
//! root client certificates are reissued when missing, signed by another CA,
//! or, for the node certificate, when the SQL ingress host changed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::actor::{Actor, ActorError, ActorResult};
use crate::cluster::{Cluster, RestartType};
use crate::controller::context::Context;
use crate::controller::status::StatusManager;
use crate::crd::{ActionType, ConditionType};
use crate::resources::common::annotations;
use crate::resources::tls_secret::{
    CA_CERT_KEY, CA_KEY_KEY, CERT_KEY, KEY_KEY, PKCS8_KEY_KEY, TlsSecret,
};
use crate::security::certs::{self, CertificateAuthority, CertifiedKey};

/// Whether a node or client secret must be issued again under `ca_pem`
pub fn needs_reissue(secret: Option<&TlsSecret>, ca_pem: &str) -> bool {
    let Some(secret) = secret.filter(|s| s.is_ready()) else {
        return true;
    };
    match secret.cert() {
        Some(cert) => !certs::is_signed_by(cert, ca_pem).unwrap_or(false),
        None => true,
    }
}

fn leaf_secret(name: String, issued: &CertifiedKey, ca_pem: &str) -> TlsSecret {
    let mut secret = TlsSecret::new(name);
    secret
        .set(CERT_KEY, issued.cert_pem.clone())
        .set(KEY_KEY, issued.key_pem.clone())
        .set(CA_CERT_KEY, ca_pem);
    secret
}

async fn load_or_create_ca(ctx: &Context, cluster: &Cluster) -> ActorResult<CertificateAuthority> {
    let name = cluster.ca_secret_name();
    let existing = TlsSecret::load(&ctx.client, &cluster.namespace(), &name).await?;
    if let Some(secret) = existing.filter(TlsSecret::is_ready_ca) {
        let (Some(cert), Some(key)) = (secret.ca_cert(), secret.get_str(CA_KEY_KEY)) else {
            return Err(ActorError::permanent(format!("CA secret {name} is not valid UTF-8")));
        };
        return Ok(CertificateAuthority::from_pem(cert, key)?);
    }

    let ca = CertificateAuthority::generate()?;
    let mut secret = TlsSecret::new(name.clone());
    secret
        .set(CA_CERT_KEY, ca.cert_pem())
        .set(CA_KEY_KEY, ca.key_pem());
    secret.save(&ctx.client, cluster).await?;
    info!(secret = %name, "generated cluster CA");
    Ok(ca)
}

pub struct GenerateCert;

#[async_trait]
impl Actor for GenerateCert {
    fn action_type(&self) -> ActionType {
        ActionType::GenerateCert
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let client = &ctx.client;
        let ns = cluster.namespace();
        let ca = load_or_create_ca(ctx, cluster).await?;
        let ca_pem = ca.cert_pem();

        let sql_host = cluster.spec().sql_ingress_host().map(str::to_string);
        let host_changed = cluster.status().sql_host != sql_host;

        let node_name = cluster.node_tls_secret_name();
        let node = TlsSecret::load(client, &ns, &node_name).await?;
        let node_was_ready = node.as_ref().is_some_and(TlsSecret::is_ready);
        let node_reissued = host_changed || needs_reissue(node.as_ref(), ca_pem);
        let node_cert = if node_reissued {
            let issued = ca.issue_node(&certs::node_hosts(cluster, &ctx.config.cluster_domain))?;
            leaf_secret(node_name.clone(), &issued, ca_pem)
                .save(client, cluster)
                .await?;
            info!(secret = %node_name, host_changed, "issued node certificate");
            issued.cert_pem
        } else {
            node.as_ref()
                .and_then(TlsSecret::cert)
                .map(str::to_string)
                .ok_or_else(|| ActorError::permanent(format!("node secret {node_name} has no certificate")))?
        };

        let client_name = cluster.client_tls_secret_name();
        let root = TlsSecret::load(client, &ns, &client_name).await?;
        if needs_reissue(root.as_ref(), ca_pem) {
            let issued = ca.issue_client(certs::ROOT_USER)?;
            let mut secret = leaf_secret(client_name.clone(), &issued, ca_pem);
            secret.set(PKCS8_KEY_KEY, issued.key_pk8.clone());
            secret.save(client, cluster).await?;
            info!(secret = %client_name, "issued root client certificate");
        }

        let mut changes = BTreeMap::from([(
            annotations::CERT_EXPIRATION.to_string(),
            Some(certs::expiration(&node_cert)?.to_rfc3339()),
        )]);
        // Running nodes only pick up a new certificate on restart
        if node_reissued && node_was_ready && cluster.is_true(ConditionType::SqlIngressExposed) {
            warn!("node certificate changed under an exposed SQL ingress, requesting rolling restart");
            changes.insert(
                annotations::RESTART_TYPE.to_string(),
                Some(RestartType::Rolling.as_str().to_string()),
            );
        }
        let updated = StatusManager::new(ctx, &ns, cluster.name())
            .update_annotations(&changes)
            .await?;
        cluster.refresh(updated);

        cluster.status_mut().sql_host = sql_host;
        cluster.set_true(ConditionType::CertificateGenerated);
        Ok(())
    }
}
