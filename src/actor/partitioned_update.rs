//! Version change of a running cluster, one pod at a time
//!
//! The version to roll to comes from the annotations written by the version
//! check; the version running is the one recorded on the stateful set.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use tracing::info;

use crate::actor::{Actor, ActorResult};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::crd::{ActionType, ConditionType};
use crate::health_checker::CockroachHealthChecker;
use crate::resources::cluster_sql::{PRESERVE_DOWNGRADE_OPTION, get_setting, set_setting};
use crate::resources::common::annotations;
use crate::resources::database::DbConnection;
use crate::update::partitioned::apply_image;
use crate::update::version::{
    UpdateKind, check_preserve_downgrade, classify, downgrade_option_for, image_name_without_version,
    parse_preserve_downgrade, parse_version, target_image,
};
use crate::update::{PartitionedUpdater, PodTarget, UpdateError};

/// Outcome of checking a transition against the cluster settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePlan {
    pub kind: UpdateKind,
    /// Preserve-downgrade value to write before rolling, if any
    pub set_preserve_downgrade: Option<String>,
}

/// Validate `current -> want` given the raw preserve-downgrade setting
pub fn plan_update(current: &str, want: &str, preserve_downgrade: &str) -> Result<UpdatePlan, UpdateError> {
    let current = parse_version(current)?;
    let want = parse_version(want)?;
    let kind = classify(&current, &want)?;
    let preserve = parse_preserve_downgrade(preserve_downgrade)?;
    check_preserve_downgrade(kind, &current, &want, preserve)?;

    let set_preserve_downgrade = match (kind, preserve) {
        (UpdateKind::MajorUpgrade, None) => Some(downgrade_option_for(&current)?),
        _ => None,
    };
    Ok(UpdatePlan {
        kind,
        set_preserve_downgrade,
    })
}

pub struct PartitionedUpdate;

#[async_trait]
impl Actor for PartitionedUpdate {
    fn action_type(&self) -> ActionType {
        ActionType::PartitionedUpdate
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let client = &ctx.client;
        let ns = cluster.namespace();
        let sts_name = cluster.statefulset_name();
        let sts = Api::<StatefulSet>::namespaced(client.clone(), &ns)
            .get(&sts_name)
            .await?;
        let running = sts
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::VERSION))
            .filter(|v| !v.is_empty())
            .cloned();

        let (Some(image), Some(version), Some(running)) = (
            cluster.container_image_annotation().map(str::to_string),
            cluster.version_annotation().map(str::to_string),
            running,
        ) else {
            info!("version annotations are missing, the version has to be checked again");
            cluster.set_false(ConditionType::CrdbVersionChecked);
            return Ok(());
        };
        if running == version {
            return Ok(());
        }

        let db = DbConnection::connect(client, cluster, ctx.config.in_cluster).await?;
        let preserve = get_setting(db.client(), PRESERVE_DOWNGRADE_OPTION).await?;
        let plan = plan_update(&running, &version, &preserve)?;
        if let Some(value) = &plan.set_preserve_downgrade {
            set_setting(db.client(), PRESERVE_DOWNGRADE_OPTION, value).await?;
            info!(%value, "set preserve downgrade option before major upgrade");
        }
        drop(db);

        let image = target_image(image_name_without_version(&image), &version);
        info!(from = %running, to = %version, kind = %plan.kind, %image, "starting partitioned update");
        let checker = CockroachHealthChecker::new(client.clone(), cluster);
        let updater = PartitionedUpdater::new(client.clone(), &ns, &sts_name, &checker);
        updater
            .run(
                |sts| apply_image(sts, &image, &version, Utc::now()),
                &PodTarget::Image(image.clone()),
            )
            .await?;
        info!(%version, "partitioned update finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_needs_no_setting() {
        let plan = plan_update("v23.2.1", "v23.2.5", "").unwrap();
        assert_eq!(plan.kind, UpdateKind::Patch);
        assert_eq!(plan.set_preserve_downgrade, None);
    }

    #[test]
    fn test_major_upgrade_pins_current_release() {
        let plan = plan_update("v23.2.4", "v24.1.0", "").unwrap();
        assert_eq!(plan.kind, UpdateKind::MajorUpgrade);
        assert_eq!(plan.set_preserve_downgrade.as_deref(), Some("23.2"));

        let pinned = plan_update("v23.2.4", "v24.1.0", "23.2").unwrap();
        assert_eq!(pinned.set_preserve_downgrade, None);
    }

    #[test]
    fn test_rollback_requires_preserved_release() {
        let plan = plan_update("v24.1.0", "v23.2.4", "23.2").unwrap();
        assert_eq!(plan.kind, UpdateKind::MajorRollback);

        let err = plan_update("v24.1.0", "v23.2.4", "").unwrap_err();
        assert!(err.to_string().contains("already finalized"));
    }

    #[test]
    fn test_skipping_a_release_is_rejected() {
        assert!(matches!(
            plan_update("v22.2.0", "v24.1.0", ""),
            Err(UpdateError::NotAllowed { .. })
        ));
        assert!(matches!(
            plan_update("latest", "v24.1.0", ""),
            Err(UpdateError::InvalidVersion { .. })
        ));
    }
}
