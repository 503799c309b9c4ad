//! Replica count and rollout waits on the database stateful set

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, ListParams, Patch, PatchParams};
use tracing::{debug, info};

use crate::controller::error::BackoffConfig;
use crate::resources::common::label_selector;
use crate::scale::{ClusterScaler, ScaleError, ScaleResult};

/// Upper bound on every rollout wait
pub const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Replicas the stateful set asks for
pub fn spec_replicas(sts: &StatefulSet) -> Option<i32> {
    sts.spec.as_ref().and_then(|s| s.replicas)
}

/// The controller has caught up with the requested replica count
pub fn replicas_settled(sts: &StatefulSet) -> bool {
    let observed = sts.status.as_ref().map(|s| s.replicas);
    observed.is_some() && observed == spec_replicas(sts)
}

/// Exactly `replicas` pods are ready and no surplus pod is still around
pub fn is_ready_to_serve(sts: &StatefulSet, replicas: i32) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    status.ready_replicas.unwrap_or(0) == replicas && status.replicas <= replicas
}

/// Handle on one stateful set, used by the scaler
pub struct CockroachStatefulSet {
    client: Client,
    namespace: String,
    name: String,
    backoff: BackoffConfig,
}

impl CockroachStatefulSet {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            backoff: BackoffConfig::polling(Duration::from_secs(1), Duration::from_secs(10)),
        }
    }

    fn api(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn get(&self) -> ScaleResult<StatefulSet> {
        Ok(self.api().get(&self.name).await?)
    }

    async fn running_pods(&self, sts: &StatefulSet) -> ScaleResult<usize> {
        let selector = sts
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default()
            .labels(&label_selector(&selector))
            .fields("status.phase=Running");
        Ok(pods.list(&params).await?.items.len())
    }
}

#[async_trait]
impl ClusterScaler for CockroachStatefulSet {
    async fn replicas(&self) -> ScaleResult<i32> {
        let sts = self.get().await?;
        spec_replicas(&sts).ok_or_else(|| ScaleError::MissingReplicas {
            name: self.name.clone(),
        })
    }

    async fn set_replicas(&self, replicas: i32) -> ScaleResult<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.api()
            .patch_scale(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(statefulset = %self.name, replicas, "set replicas");
        Ok(())
    }

    async fn wait_until_running(&self) -> ScaleResult<()> {
        self.backoff
            .retry(
                ROLLOUT_TIMEOUT,
                || async move {
                    let sts = self.get().await?;
                    if !replicas_settled(&sts) {
                        return Err(ScaleError::NotReady(format!(
                            "statefulset {} has not caught up with its replica count",
                            self.name
                        )));
                    }
                    let wanted = spec_replicas(&sts).unwrap_or(0);
                    let running = self.running_pods(&sts).await?;
                    debug!(statefulset = %self.name, running, wanted, "waiting for pods to run");
                    if i32::try_from(running).ok() != Some(wanted) {
                        return Err(ScaleError::NotReady(format!(
                            "{running} of {wanted} pods running"
                        )));
                    }
                    Ok(())
                },
                ScaleError::is_retryable,
            )
            .await
    }

    async fn wait_until_healthy(&self, replicas: i32) -> ScaleResult<()> {
        self.backoff
            .retry(
                ROLLOUT_TIMEOUT,
                || async move {
                    let sts = self.get().await?;
                    if is_ready_to_serve(&sts, replicas) {
                        Ok(())
                    } else {
                        Err(ScaleError::NotReady(format!(
                            "statefulset {} is not serving {replicas} ready replicas",
                            self.name
                        )))
                    }
                },
                ScaleError::is_retryable,
            )
            .await
    }
}
