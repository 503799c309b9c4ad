//! UI and SQL ingresses follow the `ingress` section of the spec

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams};
use tracing::info;

use crate::actor::{Actor, ActorResult};
use crate::cluster::Cluster;
use crate::controller::context::Context;
use crate::controller::error::is_kube_not_found;
use crate::crd::{ActionType, ConditionType};
use crate::resources::ingress::{IngressBuilder, IngressKind};
use crate::resources::reconcile::{Builder, Persister, reconcile};

/// What to do with one ingress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngressChange {
    Expose,
    Remove,
    Keep,
}

pub fn ingress_condition(kind: IngressKind) -> ConditionType {
    match kind {
        IngressKind::Ui => ConditionType::UiIngressExposed,
        IngressKind::Sql => ConditionType::SqlIngressExposed,
    }
}

pub fn ingress_change(cluster: &Cluster, kind: IngressKind) -> IngressChange {
    let enabled = match kind {
        IngressKind::Ui => cluster.is_ui_ingress_enabled(),
        IngressKind::Sql => cluster.is_sql_ingress_enabled(),
    };
    if enabled {
        IngressChange::Expose
    } else if cluster.is_true(ingress_condition(kind)) {
        IngressChange::Remove
    } else {
        IngressChange::Keep
    }
}

pub struct ExposeIngress;

#[async_trait]
impl Actor for ExposeIngress {
    fn action_type(&self) -> ActionType {
        ActionType::ExposeIngress
    }

    async fn act(&self, ctx: &Context, cluster: &mut Cluster) -> ActorResult<()> {
        let client = &ctx.client;
        let ns = cluster.namespace();
        let api: Api<Ingress> = Api::namespaced(client.clone(), &ns);

        for kind in [IngressKind::Ui, IngressKind::Sql] {
            let condition = ingress_condition(kind);
            match ingress_change(cluster, kind) {
                IngressChange::Expose => {
                    let builder = IngressBuilder {
                        cluster: &*cluster,
                        kind,
                    };
                    if reconcile(client, &ns, &builder, Persister::Default).await? {
                        info!(ingress = %builder.resource_name(), "exposed ingress");
                    }
                    cluster.set_true(condition);
                }
                IngressChange::Remove => {
                    let name = IngressBuilder {
                        cluster: &*cluster,
                        kind,
                    }
                    .resource_name();
                    match api.delete(&name, &DeleteParams::default()).await {
                        Ok(_) => info!(ingress = %name, "removed ingress"),
                        Err(e) if is_kube_not_found(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                    cluster.set_false(condition);
                }
                IngressChange::Keep => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CrdbCluster, CrdbClusterSpec, IngressConfig, IngressEndpoint};

    fn cluster(ui: bool) -> Cluster {
        let ingress = ui.then(|| IngressConfig {
            ui: Some(IngressEndpoint {
                host: "ui.example.com".into(),
                ..Default::default()
            }),
            sql: None,
        });
        let mut object = CrdbCluster::new(
            "crdb",
            CrdbClusterSpec {
                nodes: 3,
                ingress,
                ..Default::default()
            },
        );
        object.metadata.namespace = Some("db".into());
        Cluster::new(object)
    }

    #[test]
    fn test_enabled_ingress_is_exposed() {
        let cluster = cluster(true);
        assert_eq!(ingress_change(&cluster, IngressKind::Ui), IngressChange::Expose);
        assert_eq!(ingress_change(&cluster, IngressKind::Sql), IngressChange::Keep);
    }

    #[test]
    fn test_disabled_exposed_ingress_is_removed() {
        let mut cluster = cluster(false);
        cluster.set_true(ConditionType::UiIngressExposed);
        assert_eq!(ingress_change(&cluster, IngressKind::Ui), IngressChange::Remove);
        cluster.set_false(ConditionType::UiIngressExposed);
        assert_eq!(ingress_change(&cluster, IngressKind::Ui), IngressChange::Keep);
    }
}
