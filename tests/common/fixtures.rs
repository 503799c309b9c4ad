//! Test fixtures and builders for CrdbCluster resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let cluster = create_test_cluster("crdb", "db", 3);
//! let secure = CrdbClusterBuilder::new("crdb", "db")
//!     .with_nodes(5)
//!     .with_tls()
//!     .with_sql_ingress("sql.example.com")
//!     .build();
//! ```

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::ObjectMeta;

use cockroach_operator::cluster::Cluster;
use cockroach_operator::crd::{
    CrdbCluster, CrdbClusterSpec, IngressConfig, IngressEndpoint, PodImage, Volume, VolumeClaim,
};
use cockroach_operator::resources::common::annotations;

pub const TEST_IMAGE: &str = "cockroachdb/cockroach:v24.1.0";

/// Create a basic insecure cluster with a 10Gi claim template
pub fn create_test_cluster(name: &str, namespace: &str, nodes: i32) -> CrdbCluster {
    CrdbClusterBuilder::new(name, namespace)
        .with_nodes(nodes)
        .build()
}

/// Wrap a fixture in the in-memory model with the initial conditions seeded
pub fn test_model(object: CrdbCluster) -> Cluster {
    let mut cluster = Cluster::new(object);
    cluster.status_mut().init_conditions(Utc::now());
    cluster
}

/// Builder for CrdbCluster test fixtures
#[allow(dead_code)]
pub struct CrdbClusterBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    nodes: i32,
    image: Option<String>,
    version: Option<String>,
    tls_enabled: bool,
    data_store: Volume,
    annotations: BTreeMap<String, String>,
    ingress: Option<IngressConfig>,
    max_unavailable: Option<i32>,
    min_available: Option<i32>,
}

#[allow(dead_code)]
impl CrdbClusterBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some("test-uid-12345".to_string()),
            nodes: 3,
            image: Some(TEST_IMAGE.to_string()),
            version: None,
            tls_enabled: false,
            data_store: claim_template_store("10Gi"),
            annotations: BTreeMap::new(),
            ingress: None,
            max_unavailable: None,
            min_available: None,
        }
    }

    pub fn with_nodes(mut self, nodes: i32) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    /// Request a version from the whitelist instead of an explicit image
    pub fn with_version(mut self, version: &str) -> Self {
        self.image = None;
        self.version = Some(version.to_string());
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.tls_enabled = true;
        self
    }

    pub fn with_storage(mut self, size: &str) -> Self {
        self.data_store = claim_template_store(size);
        self
    }

    pub fn with_auto_resize(mut self) -> Self {
        self.data_store.supports_auto_resize = true;
        self
    }

    pub fn with_host_path(mut self, path: &str) -> Self {
        self.data_store = Volume {
            host_path: Some(HostPathVolumeSource {
                path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Mark the version check as done for `version` with the builder's image
    pub fn with_checked_version(self, version: &str) -> Self {
        let image = self.image.clone().unwrap_or_default();
        self.with_annotation(annotations::VERSION, version)
            .with_annotation(annotations::CONTAINER_IMAGE, &image)
    }

    pub fn with_ui_ingress(mut self, host: &str) -> Self {
        self.ingress.get_or_insert_with(IngressConfig::default).ui = Some(IngressEndpoint {
            host: host.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn with_sql_ingress(mut self, host: &str) -> Self {
        self.ingress.get_or_insert_with(IngressConfig::default).sql = Some(IngressEndpoint {
            host: host.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn with_min_available(mut self, min: i32) -> Self {
        self.min_available = Some(min);
        self
    }

    pub fn with_max_unavailable(mut self, max: i32) -> Self {
        self.max_unavailable = Some(max);
        self
    }

    pub fn build(self) -> CrdbCluster {
        CrdbCluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: self.uid,
                generation: Some(1),
                annotations: (!self.annotations.is_empty()).then_some(self.annotations),
                ..Default::default()
            },
            spec: CrdbClusterSpec {
                nodes: self.nodes,
                image: self.image.map(|name| PodImage {
                    name,
                    ..Default::default()
                }),
                cockroach_db_version: self.version,
                tls_enabled: self.tls_enabled,
                data_store: self.data_store,
                ingress: self.ingress,
                max_unavailable: self.max_unavailable,
                min_available: self.min_available,
                ..Default::default()
            },
            status: None,
        }
    }
}

fn claim_template_store(size: &str) -> Volume {
    Volume {
        pvc: Some(VolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(size.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            source: None,
        }),
        ..Default::default()
    }
}

/// A stateful set as the platform reports it, all replicas current
pub fn test_statefulset(name: &str, replicas: i32, version: &str) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("db".to_string()),
            annotations: Some(BTreeMap::from([(
                annotations::VERSION.to_string(),
                version.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("datadir".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(StatefulSetStatus {
            replicas,
            current_replicas: Some(replicas),
            ready_replicas: Some(replicas),
            ..Default::default()
        }),
    }
}

/// A bare claim with the given name
pub fn test_pvc(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("db".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}
