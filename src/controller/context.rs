use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use kube::Client;
use kube::runtime::reflector::ObjectRef;

use crate::controller::error::Result;
use crate::crd::CrdbCluster;
use crate::features::FeatureGates;
use crate::health::HealthState;
use crate::versions::VersionWhitelist;

/// Service account token mounted into every pod running on the platform
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Prefix of environment variables copied into the database container
pub const CRDB_ENV_PREFIX: &str = "CRDB_";

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Process-wide configuration, read once at startup
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub features: FeatureGates,
    pub versions: VersionWhitelist,
    /// DNS suffix used in certificate SANs
    pub cluster_domain: String,
    /// Restrict the controller to one namespace
    pub watch_namespace: Option<String>,
    /// Whether the operator itself runs inside the managed platform
    pub in_cluster: bool,
    /// `CRDB_<NAME>` variables, with the prefix stripped
    pub database_env: Vec<(String, String)>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            features: FeatureGates::default(),
            versions: VersionWhitelist::default(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            watch_namespace: None,
            in_cluster: true,
            database_env: Vec::new(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        let features = FeatureGates::from_env()?;
        let versions = VersionWhitelist::from_env();
        let cluster_domain = std::env::var("CLUSTER_DOMAIN")
            .ok()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string());
        let watch_namespace = std::env::var("WATCH_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty());

        Ok(Self {
            features,
            versions,
            cluster_domain,
            watch_namespace,
            in_cluster: Path::new(SERVICE_ACCOUNT_TOKEN_PATH).exists(),
            database_env: database_env_from(std::env::vars()),
        })
    }
}

/// Collect `CRDB_<NAME>=value` pairs as `(NAME, value)`
pub fn database_env_from<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: Vec<(String, String)> = vars
        .into_iter()
        .filter_map(|(k, v)| {
            let name = k.strip_prefix(CRDB_ENV_PREFIX)?;
            (!name.is_empty()).then(|| (name.to_string(), v))
        })
        .collect();
    env.sort();
    env
}

/// Consecutive failed reconciles per cluster, the attempt number for backoff
#[derive(Clone, Debug, Default)]
pub struct FailureCounter {
    failures: Arc<Mutex<HashMap<ObjectRef<CrdbCluster>, u32>>>,
}

impl FailureCounter {
    /// Count one more failure and return how many came before it
    pub fn record(&self, cluster: &ObjectRef<CrdbCluster>) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(cluster.clone()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset(&self, cluster: &ObjectRef<CrdbCluster>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cluster);
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Frozen operator configuration
    pub config: Arc<OperatorConfig>,
    /// Health state for metrics recording
    pub health_state: Option<Arc<HealthState>>,
    pub failures: FailureCounter,
}

impl Context {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            config,
            health_state,
            failures: FailureCounter::default(),
        }
    }
}
