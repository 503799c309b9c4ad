//! CA, node and client certificates
//!
//! The cluster CA signs one node certificate shared by every pod and one
//! client certificate for the `root` SQL user. Keys are ECDSA P-256 in
//! PKCS#8, which the database accepts as is.

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    string::Ia5String,
};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use crate::cluster::Cluster;

/// CA lifetime, ten 366-day years
pub const CA_LIFETIME_DAYS: i64 = 10 * 366;
/// Node and client certificate lifetime, five 366-day years
pub const CERT_LIFETIME_DAYS: i64 = 5 * 366;

/// Common name the database expects on node certificates
pub const NODE_COMMON_NAME: &str = "node";
pub const ROOT_USER: &str = "root";

const ORGANIZATION: &str = "Cockroach";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("invalid subject alternative name {name:?}: {reason}")]
    InvalidSan { name: String, reason: String },

    #[error("certificate parsing error: {0}")]
    Parse(String),
}

pub type CertResult<T> = Result<T, CertError>;

/// A certificate and its private key, both PEM encoded
#[derive(Clone, Debug)]
pub struct CertifiedKey {
    pub cert_pem: String,
    pub key_pem: String,
    /// The same key as DER-encoded PKCS#8
    pub key_pk8: Vec<u8>,
}

fn validity(days: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    // Allow for clock skew between the operator and the nodes
    (now - time::Duration::hours(1), now + time::Duration::days(days))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, DnValue::Utf8String(ORGANIZATION.to_string()));
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn
}

fn san(name: &str) -> CertResult<SanType> {
    if let Ok(ip) = name.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| CertError::InvalidSan {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn generate_key() -> CertResult<KeyPair> {
    KeyPair::generate().map_err(|e| CertError::KeyGeneration(e.to_string()))
}

/// The cluster certificate authority
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn generate() -> CertResult<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("Cockroach CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        (params.not_before, params.not_after) = validity(CA_LIFETIME_DAYS);

        let key = generate_key()?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CertError::Generation(format!("failed to create CA cert: {e}")))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Load a CA previously written to the CA secret
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> CertResult<Self> {
        KeyPair::from_pem(key_pem).map_err(|e| CertError::Parse(format!("CA key: {e}")))?;
        parse_certificate(cert_pem, |_| Ok(()))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn sign(&self, mut params: CertificateParams) -> CertResult<CertifiedKey> {
        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| CertError::Parse(format!("CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| CertError::Parse(format!("failed to create issuer: {e}")))?;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        (params.not_before, params.not_after) = validity(CERT_LIFETIME_DAYS);

        let key = generate_key()?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| CertError::Generation(e.to_string()))?;

        Ok(CertifiedKey {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            key_pk8: key.serialize_der(),
        })
    }

    /// Node certificate valid for server and client authentication
    pub fn issue_node(&self, hosts: &[String]) -> CertResult<CertifiedKey> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(NODE_COMMON_NAME);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = hosts.iter().map(|h| san(h)).collect::<CertResult<_>>()?;
        self.sign(params)
    }

    /// Client certificate for a SQL user
    pub fn issue_client(&self, user: &str) -> CertResult<CertifiedKey> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(user);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.subject_alt_names = vec![san(user)?];
        self.sign(params)
    }
}

/// Names every node must be reachable under
pub fn node_hosts(cluster: &Cluster, cluster_domain: &str) -> Vec<String> {
    let ns = cluster.namespace();
    let public = cluster.public_service_name();
    let discovery = cluster.discovery_service_name();
    let domain = format!("svc.{cluster_domain}");

    let mut hosts = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        public.clone(),
        format!("{public}.{ns}"),
        format!("{public}.{ns}.{domain}"),
        format!("*.{discovery}"),
        format!("*.{discovery}.{ns}"),
        format!("*.{discovery}.{ns}.{domain}"),
    ];
    if let Some(host) = cluster.spec().sql_ingress_host() {
        hosts.push(host.to_string());
    }
    hosts
}

fn parse_certificate<T>(
    pem: &str,
    f: impl FnOnce(&x509_parser::certificate::X509Certificate<'_>) -> CertResult<T>,
) -> CertResult<T> {
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| CertError::Parse(format!("failed to parse PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertError::Parse(format!("failed to parse certificate: {e}")))?;
    f(&cert)
}

/// Expiry of a PEM certificate
pub fn expiration(cert_pem: &str) -> CertResult<DateTime<Utc>> {
    parse_certificate(cert_pem, |cert| {
        let ts = cert.validity().not_after.timestamp();
        DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| CertError::Parse(format!("expiry {ts} out of range")))
    })
}

/// DNS and IP subject alternative names of a PEM certificate
pub fn subject_alt_names(cert_pem: &str) -> CertResult<Vec<String>> {
    parse_certificate(cert_pem, |cert| {
        let Some(ext) = cert
            .subject_alternative_name()
            .map_err(|e| CertError::Parse(e.to_string()))?
        else {
            return Ok(Vec::new());
        };
        Ok(ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some((*dns).to_string()),
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => <[u8; 4]>::try_from(*bytes)
                        .ok()
                        .map(|b| std::net::Ipv4Addr::from(b).to_string()),
                    16 => <[u8; 16]>::try_from(*bytes)
                        .ok()
                        .map(|b| std::net::Ipv6Addr::from(b).to_string()),
                    _ => None,
                },
                _ => None,
            })
            .collect())
    })
}

/// Whether `cert_pem` carries a valid signature from `ca_pem`
pub fn is_signed_by(cert_pem: &str, ca_pem: &str) -> CertResult<bool> {
    parse_certificate(ca_pem, |ca| {
        parse_certificate(cert_pem, |cert| {
            Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
        })
    })
}
