//! Typed model over one managed cluster
//!
//! [`Cluster`] wraps a fetched [`CrdbCluster`] with defaults applied and
//! exposes the names of owned children, port numbers and the ledger. Every
//! status and annotation mutation goes through it. [`Fetcher`] always reads
//! the object from the API server, never from the watch cache, so actions
//! start from the latest resourceVersion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::Api;
use kube::{Client, ResourceExt};

use crate::crd::{
    ActionStatus, ActionType, ConditionStatus, ConditionType, CrdbCluster, CrdbClusterSpec,
    CrdbClusterStatus,
};
use crate::resources::common::{annotations, cluster_labels, selector_labels};
use crate::versions::VersionWhitelist;

/// Mount name of the data volume, also the claim template name
pub const DATA_DIR_NAME: &str = "datadir";

/// Directory holding certificates inside database pods
pub const CERTS_DIR: &str = "/cockroach/cockroach-certs/";

/// Maximum length of a Kubernetes object name
const MAX_NAME_LENGTH: usize = 63;

/// Restart requested through the restart-type annotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartType {
    Rolling,
    FullCluster,
}

impl RestartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartType::Rolling => "Rolling",
            RestartType::FullCluster => "FullCluster",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Rolling" => Some(RestartType::Rolling),
            "FullCluster" => Some(RestartType::FullCluster),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Cluster {
    object: CrdbCluster,
    spec: CrdbClusterSpec,
    status: CrdbClusterStatus,
}

impl Cluster {
    /// Wrap an object, applying defaults to an in-memory copy of the spec
    pub fn new(object: CrdbCluster) -> Self {
        let spec = object.spec.with_defaults();
        let status = object.status.clone().unwrap_or_default();
        Self {
            object,
            spec,
            status,
        }
    }

    /// Replace the wrapped object with a freshly fetched copy, keeping the
    /// in-memory status
    pub fn refresh(&mut self, fetched: CrdbCluster) {
        self.spec = fetched.spec.with_defaults();
        self.object = fetched;
    }

    pub fn object(&self) -> &CrdbCluster {
        &self.object
    }

    pub fn spec(&self) -> &CrdbClusterSpec {
        &self.spec
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }

    pub fn namespace(&self) -> String {
        self.object.namespace().unwrap_or_default()
    }

    pub fn uid(&self) -> Option<&str> {
        self.object.metadata.uid.as_deref()
    }

    pub fn nodes(&self) -> i32 {
        self.spec.nodes
    }

    pub fn is_secure(&self) -> bool {
        self.spec.tls_enabled
    }

    /// Flag used to flavour every `cockroach` CLI invocation
    pub fn secure_mode(&self) -> String {
        if self.is_secure() {
            format!("--certs-dir={CERTS_DIR}")
        } else {
            "--insecure".to_string()
        }
    }

    pub fn discovery_service_name(&self) -> String {
        self.name()
    }

    pub fn public_service_name(&self) -> String {
        format!("{}-public", self.name())
    }

    pub fn statefulset_name(&self) -> String {
        self.name()
    }

    pub fn pdb_name(&self) -> String {
        self.name()
    }

    pub fn service_account_name(&self) -> String {
        format!("{}-sa", self.name())
    }

    pub fn role_name(&self) -> String {
        format!("{}-role", self.name())
    }

    pub fn role_binding_name(&self) -> String {
        format!("{}-rolebinding", self.name())
    }

    pub fn ui_ingress_name(&self) -> String {
        format!("ui-{}", self.name())
    }

    pub fn sql_ingress_name(&self) -> String {
        format!("sql-{}", self.name())
    }

    pub fn ca_secret_name(&self) -> String {
        format!("{}-ca", self.name())
    }

    /// Node certificate secret, external or operator-owned
    pub fn node_tls_secret_name(&self) -> String {
        self.spec
            .node_tls_secret
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{}-node", self.name()))
    }

    /// Root client certificate secret, external or operator-owned
    pub fn client_tls_secret_name(&self) -> String {
        self.spec
            .client_tls_secret
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{}-root", self.name()))
    }

    /// Whether the operator issues certificates itself
    pub fn owns_certificates(&self) -> bool {
        self.is_secure() && self.spec.node_tls_secret.as_deref().is_none_or(str::is_empty)
    }

    /// Version-check job name, unique per minute
    pub fn job_name(&self, now: DateTime<Utc>) -> String {
        let mut name = format!("{}-vcheck-{}", self.name(), now.timestamp() / 60);
        name.truncate(MAX_NAME_LENGTH);
        name.trim_end_matches('-').to_string()
    }

    /// Claim name bound to a pod ordinal
    pub fn pvc_name(&self, ordinal: i32) -> String {
        format!("{}-{}-{}", DATA_DIR_NAME, self.statefulset_name(), ordinal)
    }

    /// Stable DNS name of one pod behind the discovery service
    pub fn pod_host(&self, ordinal: i32) -> String {
        format!(
            "{}-{}.{}.{}",
            self.statefulset_name(),
            ordinal,
            self.discovery_service_name(),
            self.namespace()
        )
    }

    pub fn grpc_port(&self) -> i32 {
        self.spec.grpc_port()
    }

    pub fn http_port(&self) -> i32 {
        self.spec.http_port()
    }

    pub fn sql_port(&self) -> i32 {
        self.spec.sql_port()
    }

    pub fn is_ui_ingress_enabled(&self) -> bool {
        self.spec.ingress.as_ref().is_some_and(|i| i.ui.is_some())
    }

    pub fn is_sql_ingress_enabled(&self) -> bool {
        self.spec.ingress.as_ref().is_some_and(|i| i.sql.is_some())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        cluster_labels(&self.object)
    }

    pub fn selector(&self) -> BTreeMap<String, String> {
        selector_labels(&self.name())
    }

    /// Image the user asked for: `image.name`, else the whitelist image for
    /// `cockroachDBVersion`
    pub fn desired_image(&self, versions: &VersionWhitelist) -> Option<String> {
        if let Some(name) = self.spec.image_name() {
            return Some(name.to_string());
        }
        self.spec
            .cockroach_db_version
            .as_deref()
            .and_then(|v| versions.image_for(v))
            .map(str::to_string)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.object
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn version_annotation(&self) -> Option<&str> {
        self.annotation(annotations::VERSION)
    }

    pub fn container_image_annotation(&self) -> Option<&str> {
        self.annotation(annotations::CONTAINER_IMAGE)
    }

    /// Raw restart-type annotation value
    pub fn restart_type_annotation(&self) -> Option<&str> {
        self.annotation(annotations::RESTART_TYPE)
    }

    /// Set an annotation on the in-memory object
    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.object
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
    }

    /// In-memory status, the copy that gets persisted
    pub fn status(&self) -> &CrdbClusterStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut CrdbClusterStatus {
        &mut self.status
    }

    pub fn is_true(&self, condition: ConditionType) -> bool {
        self.status().is_true(condition)
    }

    pub fn is_false(&self, condition: ConditionType) -> bool {
        self.status().is_false(condition)
    }

    pub fn set_true(&mut self, condition: ConditionType) {
        self.status_mut()
            .set_condition(condition, ConditionStatus::True, Utc::now());
    }

    pub fn set_false(&mut self, condition: ConditionType) {
        self.status_mut()
            .set_condition(condition, ConditionStatus::False, Utc::now());
    }

    pub fn set_action_status(&mut self, action: ActionType, status: ActionStatus, message: Option<String>) {
        self.status_mut()
            .set_action(action, status, message, Utc::now());
    }

    /// Record a failed action; the cluster as a whole is failed immediately
    pub fn set_action_failed(&mut self, action: ActionType, message: String) {
        self.set_action_status(action, ActionStatus::Failed, Some(message));
        self.status_mut().cluster_status = Some(ActionStatus::Failed.to_string());
    }

    pub fn set_action_finished(&mut self, action: ActionType) {
        self.set_action_status(action, ActionStatus::Finished, None);
        self.status_mut().aggregate_cluster_status();
    }
}

/// Reads the cluster object from the API server
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Quorum read of the object, `None` when it no longer exists
    pub async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<CrdbCluster>, kube::Error> {
        let api: Api<CrdbCluster> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }

    /// Refresh a model in place, keeping its in-memory status
    pub async fn refresh(&self, cluster: &mut Cluster) -> Result<(), kube::Error> {
        let api: Api<CrdbCluster> = Api::namespaced(self.client.clone(), &cluster.namespace());
        let fetched = api.get(&cluster.name()).await?;
        cluster.refresh(fetched);
        Ok(())
    }
}
