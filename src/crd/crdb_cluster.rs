use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, HostPathVolumeSource, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, ResourceRequirements, Toleration,
    TopologySpreadConstraint,
};
use k8s_openapi::api::networking::v1::IngressTLS;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default ports served by every database node
pub const DEFAULT_GRPC_PORT: i32 = 26258;
pub const DEFAULT_HTTP_PORT: i32 = 8080;
pub const DEFAULT_SQL_PORT: i32 = 26257;

/// Default share of container memory for the block cache and SQL memory
pub const DEFAULT_MEMORY_FRACTION: &str = "25%";

pub const DEFAULT_TERMINATION_GRACE_PERIOD_SECS: i64 = 300;
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

/// CrdbCluster is the Schema for the crdbclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "crdb.cockroachlabs.com",
    version = "v1alpha1",
    kind = "CrdbCluster",
    plural = "crdbclusters",
    shortname = "crdb",
    namespaced,
    status = "CrdbClusterStatus",
    printcolumn = r#"{"name":"Nodes", "type":"integer", "jsonPath":".spec.nodes"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.clusterStatus"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CrdbClusterSpec {
    /// Number of database nodes (minimum 3)
    pub nodes: i32,

    /// Container image. Takes precedence over `cockroachDBVersion`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PodImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_port: Option<i32>,

    /// Run the cluster in secure mode
    #[serde(default)]
    pub tls_enabled: bool,

    /// Externally provided node certificate secret
    #[serde(
        default,
        rename = "nodeTLSSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub node_tls_secret: Option<String>,

    /// Externally provided root client certificate secret
    #[serde(
        default,
        rename = "clientTLSSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_tls_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,

    /// Block cache size, absolute or as a percentage of memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,

    #[serde(
        default,
        rename = "maxSQLMemory",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_sql_memory: Option<String>,

    /// Extra flags appended to `cockroach start`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    pub data_store: Volume,

    /// Release version resolved through the operator's image whitelist
    #[serde(
        default,
        rename = "cockroachDBVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub cockroach_db_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_env_variables: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressConfig>,

    /// ConfigMap holding a `logs.yaml` logging configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_config_map: Option<String>,

    #[serde(default)]
    pub automount_service_account_token: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_secs: Option<i64>,
}

/// Container image settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodImage {
    /// Image reference, e.g. `cockroachdb/cockroach:v24.1.0`
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<String>,
}

/// Data store for each node. Exactly one of `hostPath`, `pvc.spec` or
/// `pvc.source` must be set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<VolumeClaim>,

    /// Allow the operator to expand claims when the requested size grows
    #[serde(default)]
    pub supports_auto_resize: bool,
}

/// Persistent volume claim settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaim {
    /// Template for per-node claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PersistentVolumeClaimSpec>,

    /// Pre-provisioned claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PersistentVolumeClaimVolumeSource>,
}

/// Ingress configuration for the admin UI and SQL endpoints
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<IngressEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<IngressEndpoint>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTLS>,

    pub host: String,
}

/// Observed state of a CrdbCluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrdbClusterStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default)]
    pub operator_actions: Vec<ClusterAction>,

    /// Version reported by the running binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Image the version was read from
    #[serde(
        default,
        rename = "crdbcontainerimage",
        skip_serializing_if = "Option::is_none"
    )]
    pub crdb_container_image: Option<String>,

    /// SQL ingress host baked into the current node certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_status: Option<String>,
}

/// Condition types tracked on the cluster
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Initialized,
    CertificateGenerated,
    CrdbVersionChecked,
    Decommission,
    #[serde(rename = "UIIngressExposed")]
    UiIngressExposed,
    #[serde(rename = "SQLIngressExposed")]
    SqlIngressExposed,
    RestartedCluster,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Initialized => "Initialized",
            ConditionType::CertificateGenerated => "CertificateGenerated",
            ConditionType::CrdbVersionChecked => "CrdbVersionChecked",
            ConditionType::Decommission => "Decommission",
            ConditionType::UiIngressExposed => "UIIngressExposed",
            ConditionType::SqlIngressExposed => "SQLIngressExposed",
            ConditionType::RestartedCluster => "RestartedCluster",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-valued condition status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    /// RFC3339 timestamp of the last status change
    pub last_transition_time: String,
}

/// The operator's actions. Also used as the director's pick.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ActionType {
    ClusterRestart,
    #[serde(rename = "SetupRBAC")]
    SetupRbac,
    Decommission,
    VersionCheck,
    GenerateCert,
    PartitionedUpdate,
    #[serde(rename = "ResizePVC")]
    ResizePvc,
    Deploy,
    Initialize,
    ExposeIngress,
}

impl ActionType {
    /// All actions in director priority order
    pub const ALL: [ActionType; 10] = [
        ActionType::ClusterRestart,
        ActionType::SetupRbac,
        ActionType::Decommission,
        ActionType::VersionCheck,
        ActionType::GenerateCert,
        ActionType::PartitionedUpdate,
        ActionType::ResizePvc,
        ActionType::Deploy,
        ActionType::Initialize,
        ActionType::ExposeIngress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ClusterRestart => "ClusterRestart",
            ActionType::SetupRbac => "SetupRBAC",
            ActionType::Decommission => "Decommission",
            ActionType::VersionCheck => "VersionCheck",
            ActionType::GenerateCert => "GenerateCert",
            ActionType::PartitionedUpdate => "PartitionedUpdate",
            ActionType::ResizePvc => "ResizePVC",
            ActionType::Deploy => "Deploy",
            ActionType::Initialize => "Initialize",
            ActionType::ExposeIngress => "ExposeIngress",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-valued action status, also used for the aggregate `clusterStatus`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ActionStatus {
    Starting,
    Finished,
    Failed,
    #[default]
    Unknown,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Starting => "Starting",
            ActionStatus::Finished => "Finished",
            ActionStatus::Failed => "Failed",
            ActionStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAction {
    #[serde(rename = "type")]
    pub type_: ActionType,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: String,
}

impl CrdbClusterSpec {
    /// Fill in unset fields. Applying defaults twice yields the same spec.
    pub fn apply_defaults(&mut self) {
        self.grpc_port.get_or_insert(DEFAULT_GRPC_PORT);
        self.http_port.get_or_insert(DEFAULT_HTTP_PORT);
        self.sql_port.get_or_insert(DEFAULT_SQL_PORT);

        if let Some(image) = self.image.as_mut() {
            image
                .pull_policy
                .get_or_insert_with(|| DEFAULT_PULL_POLICY.to_string());
        }

        if self.max_unavailable.is_none() && self.min_available.is_none() {
            self.max_unavailable = Some(1);
        }

        if self.cache.as_deref().is_none_or(str::is_empty) {
            self.cache = Some(DEFAULT_MEMORY_FRACTION.to_string());
        }
        if self.max_sql_memory.as_deref().is_none_or(str::is_empty) {
            self.max_sql_memory = Some(DEFAULT_MEMORY_FRACTION.to_string());
        }

        self.termination_grace_period_secs
            .get_or_insert(DEFAULT_TERMINATION_GRACE_PERIOD_SECS);
    }

    /// Return a defaulted copy
    pub fn with_defaults(&self) -> Self {
        let mut spec = self.clone();
        spec.apply_defaults();
        spec
    }

    pub fn grpc_port(&self) -> i32 {
        self.grpc_port.unwrap_or(DEFAULT_GRPC_PORT)
    }

    pub fn http_port(&self) -> i32 {
        self.http_port.unwrap_or(DEFAULT_HTTP_PORT)
    }

    pub fn sql_port(&self) -> i32 {
        self.sql_port.unwrap_or(DEFAULT_SQL_PORT)
    }

    pub fn pull_policy(&self) -> String {
        self.image
            .as_ref()
            .and_then(|i| i.pull_policy.clone())
            .unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string())
    }

    pub fn pull_secret(&self) -> Option<&str> {
        self.image.as_ref().and_then(|i| i.pull_secret.as_deref())
    }

    /// Image name requested explicitly, ignoring empty strings
    pub fn image_name(&self) -> Option<&str> {
        self.image
            .as_ref()
            .map(|i| i.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// Requested SQL ingress host, if any
    pub fn sql_ingress_host(&self) -> Option<&str> {
        self.ingress
            .as_ref()
            .and_then(|i| i.sql.as_ref())
            .map(|s| s.host.as_str())
            .filter(|h| !h.is_empty())
    }
}

impl Volume {
    /// Claim template, when the data store is template-backed
    pub fn claim_template(&self) -> Option<&PersistentVolumeClaimSpec> {
        self.pvc.as_ref().and_then(|p| p.spec.as_ref())
    }

    /// Pre-provisioned claim, when the data store is a claim reference
    pub fn claim_source(&self) -> Option<&PersistentVolumeClaimVolumeSource> {
        self.pvc.as_ref().and_then(|p| p.source.as_ref())
    }

    /// Number of data-store kinds configured. Valid specs have exactly one.
    pub fn configured_kinds(&self) -> usize {
        [
            self.host_path.is_some(),
            self.claim_template().is_some(),
            self.claim_source().is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}
