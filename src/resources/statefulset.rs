//! StatefulSet generation for CockroachDB clusters
//!
//! One StatefulSet named after the cluster runs every node. Pods are started
//! in parallel and rolled through a partitioned RollingUpdate strategy so the
//! partitioned updater can replace them one ordinal at a time.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, KeyToPath, LocalObjectReference, ObjectFieldSelector, PersistentVolumeClaim,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ProjectedVolumeSource,
    ResourceFieldSelector, SecretProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::cluster::{CERTS_DIR, Cluster, DATA_DIR_NAME};
use crate::resources::common::{annotations, owner_reference};
use crate::resources::reconcile::{Builder, ResourceError};
use crate::resources::service::{GRPC_PORT_NAME, HTTP_PORT_NAME, SQL_PORT_NAME};

/// Name of the database container
pub const DB_CONTAINER_NAME: &str = "db";
/// Name of the certificate copying init container
pub const DB_INIT_CONTAINER_NAME: &str = "db-init";

pub const DATA_DIR_PATH: &str = "/cockroach/cockroach-data/";
const CERTS_VOLUME: &str = "certs";
const CERTS_PRESTAGE_VOLUME: &str = "certs-prestage";
const CERTS_PRESTAGE_DIR: &str = "/cockroach/cockroach-certs-prestage/";
const LOG_CONFIG_VOLUME: &str = "log-config";
const LOG_CONFIG_DIR: &str = "/cockroach/log-config";
const LOG_CONFIG_FILE: &str = "logs.yaml";

/// uid and fsGroup of the database process
pub const DB_USER_ID: i64 = 10001;

/// Seed nodes passed to `--join`
const MAX_JOIN_NODES: i32 = 3;

pub struct StatefulSetBuilder<'a> {
    pub cluster: &'a Cluster,
    /// Image of the database container
    pub image: String,
    /// Replica count to write. New sets start at `nodes`; existing sets
    /// keep their count, scaling is done one node at a time.
    pub replicas: i32,
    /// `CRDB_*` passthrough variables
    pub database_env: &'a [(String, String)],
}

impl Builder for StatefulSetBuilder<'_> {
    type Object = StatefulSet;

    fn resource_name(&self) -> String {
        self.cluster.statefulset_name()
    }

    fn build(&self) -> Result<StatefulSet, ResourceError> {
        let cluster = self.cluster;
        let spec = cluster.spec();
        let data_store = &spec.data_store;

        if data_store.configured_kinds() != 1 {
            return Err(ResourceError::InvalidSpec {
                kind: "StatefulSet",
                name: self.resource_name(),
                reason: "dataStore needs exactly one of hostPath, pvc.spec or pvc.source"
                    .to_string(),
            });
        }

        let mut sts_annotations = BTreeMap::new();
        if let Some(version) = cluster.version_annotation() {
            sts_annotations.insert(annotations::VERSION.to_string(), version.to_string());
        }
        if let Some(image) = cluster.container_image_annotation() {
            sts_annotations.insert(annotations::CONTAINER_IMAGE.to_string(), image.to_string());
        }

        let mut volumes = Vec::new();
        if let Some(host_path) = &data_store.host_path {
            volumes.push(Volume {
                name: DATA_DIR_NAME.to_string(),
                host_path: Some(host_path.clone()),
                ..Default::default()
            });
        } else if let Some(source) = data_store.claim_source() {
            volumes.push(Volume {
                name: DATA_DIR_NAME.to_string(),
                persistent_volume_claim: Some(source.clone()),
                ..Default::default()
            });
        }
        if cluster.is_secure() {
            volumes.extend(self.cert_volumes());
        }
        if let Some(config_map) = &spec.log_config_map {
            volumes.push(Volume {
                name: LOG_CONFIG_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let volume_claim_templates = data_store.claim_template().map(|template| {
            vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_DIR_NAME.to_string()),
                    labels: Some(cluster.selector()),
                    ..Default::default()
                },
                spec: Some(template.clone()),
                ..Default::default()
            }]
        });

        let mut init_containers = Vec::new();
        if cluster.is_secure() {
            init_containers.push(self.init_container());
        }

        let mut pod_annotations = spec.additional_annotations.clone();
        if let Some(restarted_at) = cluster.annotation(annotations::RESTARTED_AT) {
            pod_annotations.insert(
                annotations::RESTARTED_AT.to_string(),
                restarted_at.to_string(),
            );
        }

        let pod_spec = PodSpec {
            service_account_name: Some(cluster.service_account_name()),
            automount_service_account_token: Some(spec.automount_service_account_token),
            termination_grace_period_seconds: spec.termination_grace_period_secs,
            security_context: Some(PodSecurityContext {
                run_as_user: Some(DB_USER_ID),
                fs_group: Some(DB_USER_ID),
                ..Default::default()
            }),
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            containers: vec![self.db_container()],
            volumes: Some(volumes),
            affinity: spec.affinity.clone(),
            tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
            topology_spread_constraints: (!spec.topology_spread_constraints.is_empty())
                .then(|| spec.topology_spread_constraints.clone()),
            node_selector: (!spec.node_selector.is_empty()).then(|| spec.node_selector.clone()),
            priority_class_name: spec.priority_class_name.clone(),
            image_pull_secrets: spec.pull_secret().map(|s| {
                vec![LocalObjectReference {
                    name: s.to_string(),
                }]
            }),
            ..Default::default()
        };

        Ok(StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.resource_name()),
                namespace: Some(cluster.namespace()),
                labels: Some(cluster.labels()),
                annotations: Some(sts_annotations),
                owner_references: Some(vec![owner_reference(cluster.object())]),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                service_name: Some(cluster.discovery_service_name()),
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(cluster.selector()),
                    ..Default::default()
                },
                pod_management_policy: Some("Parallel".to_string()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        partition: Some(0),
                        ..Default::default()
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(cluster.labels()),
                        annotations: (!pod_annotations.is_empty()).then_some(pod_annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                volume_claim_templates,
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

impl StatefulSetBuilder<'_> {
    fn db_container(&self) -> Container {
        let cluster = self.cluster;
        let spec = cluster.spec();
        let scheme = if cluster.is_secure() { "HTTPS" } else { "HTTP" };

        let mut volume_mounts = vec![VolumeMount {
            name: DATA_DIR_NAME.to_string(),
            mount_path: DATA_DIR_PATH.to_string(),
            ..Default::default()
        }];
        if cluster.is_secure() {
            volume_mounts.push(VolumeMount {
                name: CERTS_VOLUME.to_string(),
                mount_path: CERTS_DIR.to_string(),
                ..Default::default()
            });
        }
        if spec.log_config_map.is_some() {
            volume_mounts.push(VolumeMount {
                name: LOG_CONFIG_VOLUME.to_string(),
                mount_path: LOG_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        Container {
            name: DB_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(spec.pull_policy()),
            command: Some(vec![
                "/bin/bash".to_string(),
                "-ecx".to_string(),
                start_command(cluster),
            ]),
            env: Some(self.env()),
            ports: Some(vec![
                container_port(GRPC_PORT_NAME, cluster.grpc_port()),
                container_port(HTTP_PORT_NAME, cluster.http_port()),
                container_port(SQL_PORT_NAME, cluster.sql_port()),
            ]),
            resources: spec.resources.clone(),
            liveness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/health".to_string()),
                    port: IntOrString::String(HTTP_PORT_NAME.to_string()),
                    scheme: Some(scheme.to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(30),
                period_seconds: Some(5),
                ..Default::default()
            }),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/health?ready=1".to_string()),
                    port: IntOrString::String(HTTP_PORT_NAME.to_string()),
                    scheme: Some(scheme.to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(5),
                failure_threshold: Some(2),
                ..Default::default()
            }),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    /// Copies the projected certificates into a writable directory so the
    /// key permissions can be tightened
    fn init_container(&self) -> Container {
        let cluster = self.cluster;
        let command = format!(
            "cp -p {CERTS_PRESTAGE_DIR}..data/* {CERTS_DIR} && chmod 700 {CERTS_DIR}*.key && chown {DB_USER_ID}:{DB_USER_ID} {CERTS_DIR}*.key"
        );
        Container {
            name: DB_INIT_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(cluster.spec().pull_policy()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), command]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: CERTS_VOLUME.to_string(),
                    mount_path: CERTS_DIR.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: CERTS_PRESTAGE_VOLUME.to_string(),
                    mount_path: CERTS_PRESTAGE_DIR.to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    fn cert_volumes(&self) -> Vec<Volume> {
        let cluster = self.cluster;
        let item = |key: &str, path: &str| KeyToPath {
            key: key.to_string(),
            path: path.to_string(),
            ..Default::default()
        };

        vec![
            Volume {
                name: CERTS_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: CERTS_PRESTAGE_VOLUME.to_string(),
                projected: Some(ProjectedVolumeSource {
                    default_mode: Some(0o400),
                    sources: Some(vec![
                        VolumeProjection {
                            secret: Some(SecretProjection {
                                name: cluster.node_tls_secret_name(),
                                items: Some(vec![
                                    item("ca.crt", "ca.crt"),
                                    item("tls.crt", "node.crt"),
                                    item("tls.key", "node.key"),
                                ]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        VolumeProjection {
                            secret: Some(SecretProjection {
                                name: cluster.client_tls_secret_name(),
                                items: Some(vec![
                                    item("tls.crt", "client.root.crt"),
                                    item("tls.key", "client.root.key"),
                                ]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                }),
                ..Default::default()
            },
        ]
    }

    fn env(&self) -> Vec<EnvVar> {
        let resource_ref = |name: &str, resource: &str, divisor: &str| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                resource_field_ref: Some(ResourceFieldSelector {
                    container_name: Some(DB_CONTAINER_NAME.to_string()),
                    resource: resource.to_string(),
                    divisor: Some(Quantity(divisor.to_string())),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut env = vec![
            EnvVar {
                name: "POD_NAME".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            resource_ref("GOMAXPROCS", "limits.cpu", "1"),
            resource_ref("MEMORY_LIMIT_MIB", "limits.memory", "1Mi"),
        ];

        env.extend(self.database_env.iter().map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        }));
        env.extend(self.cluster.spec().pod_env_variables.iter().cloned());
        env
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// `--join` list naming up to three seed pods
pub fn join_addresses(cluster: &Cluster) -> String {
    (0..cluster.nodes().clamp(1, MAX_JOIN_NODES))
        .map(|i| {
            format!(
                "{}-{}.{}.{}:{}",
                cluster.statefulset_name(),
                i,
                cluster.discovery_service_name(),
                cluster.namespace(),
                cluster.grpc_port()
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Shell command starting the database node
pub fn start_command(cluster: &Cluster) -> String {
    let spec = cluster.spec();
    let logging = match &spec.log_config_map {
        Some(_) => format!("--log-config-file={LOG_CONFIG_DIR}/{LOG_CONFIG_FILE}"),
        None => "--logtostderr=INFO".to_string(),
    };

    let mut args = vec![
        "exec /cockroach/cockroach.sh start".to_string(),
        format!("--join={}", join_addresses(cluster)),
        format!(
            "--advertise-host=$(POD_NAME).{}.{}",
            cluster.discovery_service_name(),
            cluster.namespace()
        ),
        logging,
        cluster.secure_mode(),
        format!("--http-port={}", cluster.http_port()),
        format!("--sql-addr=:{}", cluster.sql_port()),
        format!("--listen-addr=:{}", cluster.grpc_port()),
        format!("--cache={}", spec.cache.as_deref().unwrap_or("25%")),
        format!(
            "--max-sql-memory={}",
            spec.max_sql_memory.as_deref().unwrap_or("25%")
        ),
    ];
    args.extend(spec.additional_args.iter().cloned());
    args.join(" ")
}
