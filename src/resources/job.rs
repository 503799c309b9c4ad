//! One-shot job reporting the version of a container image

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, PodSpec, PodTemplateSpec};
use kube::core::ObjectMeta;

use crate::cluster::Cluster;
use crate::resources::common::{labels, owner_reference};
use crate::resources::reconcile::{Builder, ResourceError};

pub const JOB_CONTAINER_NAME: &str = "crdb";

const COMPONENT_VERSION_CHECK: &str = "version-check";

/// Prints the build tag of the binary in the image
pub const GET_TAG_VERSION_COMMAND: &str =
    "/cockroach/cockroach version | grep 'Build Tag:'| awk '{print $3}'";

/// Keeps the pod alive long enough for its log to be read
const JOB_SLEEP_SECS: u32 = 120;
const JOB_TTL_SECS: i32 = 300;

pub struct VersionCheckJobBuilder<'a> {
    pub cluster: &'a Cluster,
    pub name: String,
    pub image: String,
}

impl VersionCheckJobBuilder<'_> {
    /// Labels on the job pod, used to find it again. The component differs
    /// from the database pods so the stateful set selector never matches.
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut pod_labels = self.cluster.selector();
        pod_labels.insert(labels::COMPONENT.to_string(), COMPONENT_VERSION_CHECK.to_string());
        pod_labels.insert(labels::JOB_NAME.to_string(), self.name.clone());
        pod_labels
    }
}

impl Builder for VersionCheckJobBuilder<'_> {
    type Object = Job;

    fn resource_name(&self) -> String {
        self.name.clone()
    }

    fn build(&self) -> Result<Job, ResourceError> {
        let cluster = self.cluster;
        let spec = cluster.spec();

        let container = Container {
            name: JOB_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(spec.pull_policy()),
            resources: spec.resources.clone(),
            command: Some(vec!["/bin/bash".to_string()]),
            args: Some(vec![
                "-c".to_string(),
                format!("{GET_TAG_VERSION_COMMAND}; sleep {JOB_SLEEP_SECS}"),
            ]),
            ..Default::default()
        };

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(cluster.namespace()),
                labels: Some(cluster.labels()),
                owner_references: Some(vec![owner_reference(cluster.object())]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                ttl_seconds_after_finished: Some(JOB_TTL_SECS),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.pod_labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        restart_policy: Some("Never".to_string()),
                        termination_grace_period_seconds: Some(60),
                        automount_service_account_token: Some(false),
                        service_account_name: Some(cluster.service_account_name()),
                        image_pull_secrets: spec.pull_secret().map(|s| {
                            vec![LocalObjectReference {
                                name: s.to_string(),
                            }]
                        }),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
