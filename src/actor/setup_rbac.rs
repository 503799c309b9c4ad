//! Service account, role and role binding used by the database pods

use async_trait::async_trait;
use tracing::info;

use crate::actor::{Actor, ActorResult};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::crd::ActionType;
use crate::resources::rbac::{RoleBindingBuilder, RoleBuilder, ServiceAccountBuilder};
use crate::resources::reconcile::{Persister, reconcile};

pub struct SetupRbac;

#[async_trait]
impl Actor for SetupRbac {
    fn action_type(&self) -> ActionType {
        ActionType::SetupRbac
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let cluster: &Cluster = cluster;
        let ns = cluster.namespace();
        let client = &ctx.client;

        let mut changed = reconcile(client, &ns, &ServiceAccountBuilder { cluster }, Persister::Default).await?;
        changed |= reconcile(client, &ns, &RoleBuilder { cluster }, Persister::Default).await?;
        changed |= reconcile(client, &ns, &RoleBindingBuilder { cluster }, Persister::Default).await?;

        if changed {
            info!(service_account = %cluster.service_account_name(), "rbac resources reconciled");
        }
        Ok(())
    }
}
