//! Partitioned rolling update of the database stateful set
//!
//! The template is changed once, together with the first partition write, so
//! only the highest ordinal rolls. Every following step lowers the partition
//! by one after the previous pod runs the new template and turns ready. A
//! pod that already matches the target is skipped, which makes a retried
//! update resume where the last attempt stopped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

use crate::controller::error::BackoffConfig;
use crate::health_checker::HealthChecker;
use crate::resources::common::annotations;
use crate::resources::statefulset::{DB_CONTAINER_NAME, DB_INIT_CONTAINER_NAME};
use crate::scale::statefulset::spec_replicas;
use crate::update::{UpdateError, UpdateResult};

/// Longest wait for one pod to come back with the new template
pub const POD_UPDATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Cap on the interval between pod checks
pub const POD_MAX_POLL_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default pause between two ordinals
pub const DEFAULT_ORDINAL_PAUSE: Duration = Duration::from_secs(60);

const IMAGE_PULL_REASONS: [&str; 2] = ["ImagePullBackOff", "ErrImagePull"];

/// What an updated pod must show before the next ordinal rolls
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodTarget {
    /// The database container runs this image
    Image(String),
    /// The pod carries this annotation value
    Annotation { key: String, value: String },
}

/// The stateful set controller has not finished a previous rollout
pub fn is_updating(sts: &StatefulSet) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or(0);
    if observed == 0 {
        return false;
    }
    if status.current_revision != status.update_revision {
        return true;
    }
    sts.metadata.generation.unwrap_or(0) > observed && spec_replicas(sts) == Some(status.replicas)
}

/// Every pod the stateful set runs reports ready
pub fn all_replicas_ready(sts: &StatefulSet) -> bool {
    sts.status
        .as_ref()
        .is_some_and(|s| s.ready_replicas.unwrap_or(0) == s.replicas)
}

pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn container_image<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == name)
        .and_then(|c| c.image.as_deref())
}

/// Waiting reason of a container stuck pulling its image
pub fn image_pull_failure(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    status
        .container_statuses
        .iter()
        .chain(status.init_container_statuses.iter())
        .flatten()
        .filter_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .find(|reason| IMAGE_PULL_REASONS.contains(reason))
        .map(str::to_string)
}

/// Check one pod against the target. Not-ready results are retryable, an
/// image that cannot be pulled is not.
pub fn verify_pod(pod: &Pod, target: &PodTarget) -> UpdateResult<()> {
    let name = pod.name_any();
    if let Some(reason) = image_pull_failure(pod) {
        return Err(UpdateError::ImagePull { pod: name, reason });
    }
    match target {
        PodTarget::Image(image) => {
            let current = container_image(pod, DB_CONTAINER_NAME).unwrap_or_default();
            if current != image {
                return Err(UpdateError::NotReady(format!(
                    "pod {name} runs {current}, waiting for {image}"
                )));
            }
        }
        PodTarget::Annotation { key, value } => {
            if pod.annotations().get(key) != Some(value) {
                return Err(UpdateError::NotReady(format!(
                    "pod {name} has not been recreated yet"
                )));
            }
        }
    }
    if !pod_is_ready(pod) {
        return Err(UpdateError::NotReady(format!("pod {name} is not ready")));
    }
    Ok(())
}

pub fn set_partition(sts: &mut StatefulSet, partition: i32) {
    if let Some(spec) = sts.spec.as_mut() {
        let strategy = spec
            .update_strategy
            .get_or_insert_with(StatefulSetUpdateStrategy::default);
        strategy.type_ = Some("RollingUpdate".to_string());
        strategy
            .rolling_update
            .get_or_insert_with(RollingUpdateStatefulSetStrategy::default)
            .partition = Some(partition);
    }
}

fn set_container_image(containers: &mut [Container], name: &str, image: &str) -> bool {
    match containers.iter_mut().find(|c| c.name == name) {
        Some(container) => {
            container.image = Some(image.to_string());
            true
        }
        None => false,
    }
}

/// Point the template at a new image and record the previous version in the
/// history annotation. Applying the same version twice records it once.
pub fn apply_image(
    sts: &mut StatefulSet,
    image: &str,
    version: &str,
    now: DateTime<Utc>,
) -> UpdateResult<()> {
    let name = sts.name_any();
    let not_found = || UpdateError::ContainerNotFound {
        statefulset: name.clone(),
    };
    let pod_spec = sts
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(not_found)?;
    if !set_container_image(&mut pod_spec.containers, DB_CONTAINER_NAME, image) {
        return Err(not_found());
    }
    if let Some(init) = pod_spec.init_containers.as_mut() {
        set_container_image(init, DB_INIT_CONTAINER_NAME, image);
    }

    let sts_annotations = sts.annotations_mut();
    let previous = sts_annotations.get(annotations::VERSION).cloned();
    if let Some(previous) = previous.filter(|p| p != version) {
        let entry = format!("{}={previous}", now.to_rfc3339());
        let history = match sts_annotations.get(annotations::HISTORY) {
            Some(h) if !h.is_empty() => format!("{h} {entry}"),
            _ => entry,
        };
        sts_annotations.insert(annotations::HISTORY.to_string(), history);
    }
    sts_annotations.insert(annotations::VERSION.to_string(), version.to_string());
    sts_annotations.insert(annotations::CONTAINER_IMAGE.to_string(), image.to_string());
    Ok(())
}

/// Stamp the pod template so every pod is recreated
pub fn stamp_restart(sts: &mut StatefulSet, stamp: &str) {
    if let Some(spec) = sts.spec.as_mut() {
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default)
            .insert(annotations::RESTARTED_AT.to_string(), stamp.to_string());
    }
}

/// Rolls one stateful set, highest ordinal first
pub struct PartitionedUpdater<'a> {
    client: Client,
    namespace: String,
    statefulset: String,
    health_checker: &'a dyn HealthChecker,
    pause: Duration,
    pod_timeout: Duration,
    backoff: BackoffConfig,
}

impl<'a> PartitionedUpdater<'a> {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        statefulset: impl Into<String>,
        health_checker: &'a dyn HealthChecker,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            statefulset: statefulset.into(),
            health_checker,
            pause: DEFAULT_ORDINAL_PAUSE,
            pod_timeout: POD_UPDATE_TIMEOUT,
            backoff: BackoffConfig::polling(Duration::from_secs(1), POD_MAX_POLL_INTERVAL),
        }
    }

    fn statefulsets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn check_pod(&self, pod: &str, target: &PodTarget) -> UpdateResult<()> {
        match self.pods().get_opt(pod).await? {
            Some(p) => verify_pod(&p, target),
            None => Err(UpdateError::NotReady(format!("pod {pod} does not exist yet"))),
        }
    }

    async fn wait_all_ready(&self) -> UpdateResult<()> {
        self.backoff
            .retry(
                self.pod_timeout,
                || async move {
                    let sts = self.statefulsets().get(&self.statefulset).await?;
                    if all_replicas_ready(&sts) {
                        Ok(())
                    } else {
                        Err(UpdateError::NotReady(format!(
                            "not all pods of {} are ready",
                            self.statefulset
                        )))
                    }
                },
                UpdateError::is_retryable,
            )
            .await
    }

    async fn wait_pod(&self, pod: &str, target: &PodTarget) -> UpdateResult<()> {
        let timeout = self.pod_timeout;
        self.backoff
            .retry(timeout, || self.check_pod(pod, target), UpdateError::is_retryable)
            .await
            .map_err(|e| match e {
                UpdateError::NotReady(reason) => {
                    debug!(%pod, %reason, "gave up waiting for pod");
                    UpdateError::PodTimeout {
                        pod: pod.to_string(),
                        timeout,
                    }
                }
                other => other,
            })
    }

    /// Apply `mutate` to the template and roll every pod until it reaches
    /// `target`
    #[instrument(skip(self, mutate, target), fields(statefulset = %self.statefulset))]
    pub async fn run<F>(&self, mutate: F, target: &PodTarget) -> UpdateResult<()>
    where
        F: Fn(&mut StatefulSet) -> UpdateResult<()>,
    {
        let sts = self.statefulsets().get(&self.statefulset).await?;
        if is_updating(&sts) {
            return Err(UpdateError::NotReady(
                "statefulset is updating, waiting for the update to finish".to_string(),
            ));
        }
        let replicas = spec_replicas(&sts).ok_or_else(|| UpdateError::MissingReplicas {
            name: self.statefulset.clone(),
        })?;

        let mut template_written = false;
        for partition in (0..replicas).rev() {
            let pod = format!("{}-{partition}", self.statefulset);
            match self.check_pod(&pod, target).await {
                Ok(()) => {
                    debug!(%pod, "pod already updated, skipping");
                    continue;
                }
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }

            self.wait_all_ready().await?;

            let mut sts = self.statefulsets().get(&self.statefulset).await?;
            if !template_written {
                mutate(&mut sts)?;
            }
            set_partition(&mut sts, partition);
            self.statefulsets()
                .replace(&self.statefulset, &PostParams::default(), &sts)
                .await?;
            template_written = true;
            info!(partition, "advanced rolling update partition");

            self.wait_pod(&pod, target).await?;
            info!(%pod, "pod updated");

            if partition > 0 {
                self.health_checker.probe(partition).await?;
                tokio::time::sleep(self.pause).await;
            }
        }
        Ok(())
    }
}
