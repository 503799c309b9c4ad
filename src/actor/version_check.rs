//! Reads the binary version of the requested image
//!
//! A one-shot job prints the build tag of the image and then sleeps so its
//! log can be read. The reported version and the image are written to the
//! cluster annotations and status; the deploy and update actions read them
//! from there.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actor::{Actor, ActorError, ActorResult};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, is_retryable_kube_error};
use crate::controller::status::StatusManager;
use crate::crd::{ActionType, ConditionType};
use crate::resources::common::{annotations, label_selector};
use crate::resources::job::{JOB_CONTAINER_NAME, VersionCheckJobBuilder};
use crate::resources::reconcile::Builder;
use crate::update::partitioned::image_pull_failure;
use crate::versions::VersionWhitelist;

/// How long the job pod gets to report a version
pub const JOB_POD_TIMEOUT: Duration = Duration::from_secs(2 * 60);

const JOB_DELETE_GRACE_SECS: u32 = 5;

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(
        "Cockroach image name and cockroachDBVersion api fields are not set, you must set one of them"
    )]
    MissingImage,

    #[error("crdb version {version} not supported")]
    Unsupported { version: String },

    #[error("job pod {pod} cannot pull image {image}: {reason}")]
    ImagePull {
        pod: String,
        image: String,
        reason: String,
    },

    #[error("pod of job {job} is not running yet")]
    PodNotRunning { job: String },

    #[error("job {job} has not reported a version yet")]
    EmptyVersion { job: String },

    #[error("job {job} finished without reporting a version")]
    JobFinished { job: String },
}

impl VersionError {
    /// Whether waiting on the job pod should continue
    pub fn is_retryable(&self) -> bool {
        match self {
            VersionError::Kube(e) => is_retryable_kube_error(e),
            VersionError::PodNotRunning { .. } | VersionError::EmptyVersion { .. } => true,
            _ => false,
        }
    }
}

impl From<VersionError> for ActorError {
    fn from(e: VersionError) -> Self {
        match e {
            VersionError::Kube(e) => e.into(),
            VersionError::MissingImage | VersionError::Unsupported { .. } => ActorError::Validation {
                message: e.to_string(),
                source: Some(Box::new(e)),
            },
            VersionError::PodNotRunning { .. } => ActorError::NotReady {
                message: e.to_string(),
                source: Some(Box::new(e)),
            },
            VersionError::ImagePull { .. }
            | VersionError::EmptyVersion { .. }
            | VersionError::JobFinished { .. } => ActorError::Permanent {
                message: e.to_string(),
                source: Some(Box::new(e)),
            },
        }
    }
}

/// Image to check. `image.name` wins; otherwise `cockroachDBVersion` must be
/// whitelisted.
pub fn resolve_image(cluster: &Cluster, versions: &VersionWhitelist) -> Result<String, VersionError> {
    if let Some(name) = cluster.spec().image_name() {
        return Ok(name.to_string());
    }
    let version = cluster
        .spec()
        .cockroach_db_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(VersionError::MissingImage)?;
    versions
        .image_for(version)
        .map(str::to_string)
        .ok_or_else(|| VersionError::Unsupported {
            version: version.to_string(),
        })
}

/// Build tag printed by the job, without line breaks
pub fn parse_build_tag(log: &str) -> Option<String> {
    let tag: String = log.chars().filter(|c| *c != '\n' && *c != '\r').collect();
    let tag = tag.trim();
    (!tag.is_empty()).then(|| tag.to_string())
}

/// Completed or failed
pub fn is_job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        })
}

/// Most recently created pod; retries of the job leave older ones behind
pub fn newest_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter().max_by_key(|p| p.creation_timestamp().map(|t| t.0))
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

/// The version-check job as seen by the action
#[async_trait]
pub trait VersionJob: Send + Sync {
    /// Build tag reported by the job pod
    async fn read_version(&self) -> Result<String, VersionError>;
    async fn delete(&self) -> Result<(), VersionError>;
}

/// Poll the job until it reports a version or fails for good, then remove it.
///
/// The job name changes every minute, so a job left behind after a failure
/// would never be reused.
pub async fn read_and_remove(
    job: &dyn VersionJob,
    backoff: &BackoffConfig,
    timeout: Duration,
) -> Result<String, VersionError> {
    let result = backoff
        .retry(timeout, || job.read_version(), VersionError::is_retryable)
        .await;
    if let Err(e) = &result {
        warn!(error = %e, "version check job failed");
    }
    if let Err(e) = job.delete().await {
        warn!(error = %e, "failed to delete version check job");
    }
    result
}

struct JobReader<'a> {
    client: &'a Client,
    namespace: &'a str,
    job: &'a str,
    image: &'a str,
    selector: String,
}

#[async_trait]
impl VersionJob for JobReader<'_> {
    async fn read_version(&self) -> Result<String, VersionError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), self.namespace);
        let job = jobs.get(self.job).await?;
        if is_job_finished(&job) {
            return Err(VersionError::JobFinished {
                job: self.job.to_string(),
            });
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), self.namespace);
        let list = pods.list(&ListParams::default().labels(&self.selector)).await?;
        let not_running = || VersionError::PodNotRunning {
            job: self.job.to_string(),
        };
        let pod = newest_pod(&list.items).ok_or_else(not_running)?;
        if let Some(reason) = image_pull_failure(pod) {
            return Err(VersionError::ImagePull {
                pod: pod.name_any(),
                image: self.image.to_string(),
                reason,
            });
        }
        if !pod_is_running(pod) {
            return Err(not_running());
        }

        let params = LogParams {
            container: Some(JOB_CONTAINER_NAME.to_string()),
            ..Default::default()
        };
        let log = pods.logs(&pod.name_any(), &params).await?;
        debug!(pod = %pod.name_any(), %log, "version check output");
        parse_build_tag(&log).ok_or_else(|| VersionError::EmptyVersion {
            job: self.job.to_string(),
        })
    }

    async fn delete(&self) -> Result<(), VersionError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), self.namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(JOB_DELETE_GRACE_SECS),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match jobs.delete(self.job, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct VersionCheck;

#[async_trait]
impl Actor for VersionCheck {
    fn action_type(&self) -> ActionType {
        ActionType::VersionCheck
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let versions = &ctx.config.versions;
        let image = resolve_image(cluster, versions)?;
        let ns = cluster.namespace();
        let job_name = cluster.job_name(Utc::now());
        info!(job = %job_name, %image, "checking the version of the requested image");

        let builder = VersionCheckJobBuilder {
            cluster,
            name: job_name.clone(),
            image: image.clone(),
        };
        let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
        if jobs.get_opt(&job_name).await?.is_none() {
            jobs.create(&PostParams::default(), &builder.build()?).await?;
            info!(job = %job_name, "created version check job");
        }

        let reader = JobReader {
            client: &ctx.client,
            namespace: &ns,
            job: &job_name,
            image: &image,
            selector: label_selector(&builder.pod_labels()),
        };
        let backoff = BackoffConfig::polling(Duration::from_secs(2), Duration::from_secs(15));
        let version = read_and_remove(&reader, &backoff, JOB_POD_TIMEOUT).await?;

        if cluster.spec().image_name().is_none() && !versions.contains(&version) {
            return Err(VersionError::Unsupported { version }.into());
        }

        let changes = BTreeMap::from([
            (annotations::VERSION.to_string(), Some(version.clone())),
            (annotations::CONTAINER_IMAGE.to_string(), Some(image.clone())),
        ]);
        let updated = StatusManager::new(ctx, &ns, cluster.name())
            .update_annotations(&changes)
            .await?;
        cluster.refresh(updated);

        let status = cluster.status_mut();
        status.version = Some(version.clone());
        status.crdb_container_image = Some(image.clone());
        cluster.set_true(ConditionType::CrdbVersionChecked);
        info!(%version, %image, "version check finished");
        Ok(())
    }
}
