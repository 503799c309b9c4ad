//! Unit tests for child object builders
//!
//! Every child carries an owner reference to the cluster so that deleting
//! the cluster removes it.

use cockroach_operator::cluster::Cluster;
use cockroach_operator::resources::Builder;
use cockroach_operator::resources::ingress::{IngressBuilder, IngressKind};
use cockroach_operator::resources::pdb::PdbBuilder;
use cockroach_operator::resources::rbac::{RoleBindingBuilder, RoleBuilder, ServiceAccountBuilder};
use cockroach_operator::resources::service::{DiscoveryServiceBuilder, PublicServiceBuilder};
use cockroach_operator::resources::statefulset::{
    DB_CONTAINER_NAME, DB_INIT_CONTAINER_NAME, StatefulSetBuilder, join_addresses, start_command,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::common::{CrdbClusterBuilder, TEST_IMAGE, test_model};

fn cluster(builder: CrdbClusterBuilder) -> Cluster {
    test_model(builder.build())
}

fn sts_builder(cluster: &Cluster) -> StatefulSetBuilder<'_> {
    StatefulSetBuilder {
        cluster,
        image: TEST_IMAGE.to_string(),
        replicas: cluster.nodes(),
        database_env: &[],
    }
}

fn assert_owned(owners: &[OwnerReference]) {
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "CrdbCluster");
    assert_eq!(owners[0].name, "crdb");
    assert_eq!(owners[0].uid, "test-uid-12345");
    assert_eq!(owners[0].controller, Some(true));
}

mod ownership_tests {
    use super::*;

    #[test]
    fn test_every_child_is_owned() {
        let cluster = cluster(
            CrdbClusterBuilder::new("crdb", "db")
                .with_ui_ingress("ui.example.com")
                .with_sql_ingress("sql.example.com"),
        );

        assert_owned(sts_builder(&cluster).build().unwrap().owner_references());
        assert_owned(DiscoveryServiceBuilder { cluster: &cluster }.build().unwrap().owner_references());
        assert_owned(PublicServiceBuilder { cluster: &cluster }.build().unwrap().owner_references());
        assert_owned(PdbBuilder { cluster: &cluster }.build().unwrap().owner_references());
        assert_owned(ServiceAccountBuilder { cluster: &cluster }.build().unwrap().owner_references());
        assert_owned(RoleBuilder { cluster: &cluster }.build().unwrap().owner_references());
        assert_owned(RoleBindingBuilder { cluster: &cluster }.build().unwrap().owner_references());
        for kind in [IngressKind::Ui, IngressKind::Sql] {
            let ingress = IngressBuilder { cluster: &cluster, kind }.build().unwrap();
            assert_owned(ingress.owner_references());
        }
    }
}

mod statefulset_tests {
    use super::*;

    #[test]
    fn test_insecure_statefulset() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db"));
        let sts = sts_builder(&cluster).build().unwrap();
        assert_eq!(sts.name_any(), "crdb");

        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("crdb"));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
        assert_eq!(spec.volume_claim_templates.as_ref().unwrap()[0].name_any(), "datadir");

        let pod = spec.template.spec.as_ref().unwrap();
        assert!(pod.init_containers.is_none());
        assert_eq!(pod.service_account_name.as_deref(), Some("crdb-sa"));
        assert_eq!(pod.containers[0].name, DB_CONTAINER_NAME);
        assert_eq!(pod.containers[0].image.as_deref(), Some(TEST_IMAGE));
    }

    #[test]
    fn test_secure_statefulset_mounts_certs() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db").with_tls());
        let sts = sts_builder(&cluster).build().unwrap();
        let pod = sts.spec.unwrap().template.spec.unwrap();

        let init = pod.init_containers.unwrap();
        assert_eq!(init[0].name, DB_INIT_CONTAINER_NAME);
        let volumes = pod.volumes.unwrap();
        let projected = volumes.iter().find_map(|v| v.projected.as_ref()).unwrap();
        let secrets: Vec<&str> = projected
            .sources
            .as_ref()
            .unwrap()
            .iter()
            .filter_map(|s| s.secret.as_ref().map(|s| s.name.as_str()))
            .collect();
        assert_eq!(secrets, vec!["crdb-node", "crdb-root"]);
    }

    #[test]
    fn test_host_path_has_no_claim_template() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db").with_host_path("/mnt/crdb"));
        let sts = sts_builder(&cluster).build().unwrap();
        let spec = sts.spec.unwrap();
        assert!(spec.volume_claim_templates.is_none());
        let volumes = spec.template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|v| v.host_path.is_some()));
    }

    #[test]
    fn test_start_command() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db").with_nodes(5));
        assert_eq!(
            join_addresses(&cluster),
            "crdb-0.crdb.db:26258,crdb-1.crdb.db:26258,crdb-2.crdb.db:26258"
        );
        let command = start_command(&cluster);
        assert!(command.starts_with("exec /cockroach/cockroach.sh start"));
        assert!(command.contains("--insecure"));
        assert!(command.contains("--advertise-host=$(POD_NAME).crdb.db"));
    }
}

mod service_tests {
    use super::*;

    #[test]
    fn test_discovery_service_is_headless() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db"));
        let svc = DiscoveryServiceBuilder { cluster: &cluster }.build().unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.ports.unwrap().len(), 3);
    }

    #[test]
    fn test_public_service_name() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db"));
        let svc = PublicServiceBuilder { cluster: &cluster }.build().unwrap();
        assert_eq!(svc.name_any(), "crdb-public");
    }
}

mod pdb_tests {
    use super::*;

    #[test]
    fn test_default_max_unavailable() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db"));
        let pdb = PdbBuilder { cluster: &cluster }.build().unwrap();
        assert_eq!(pdb.spec.unwrap().max_unavailable, Some(IntOrString::Int(1)));
    }

    #[test]
    fn test_min_available_wins() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db").with_min_available(2));
        let spec = PdbBuilder { cluster: &cluster }.build().unwrap().spec.unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(2)));
        assert_eq!(spec.max_unavailable, None);
    }

    #[test]
    fn test_single_node_needs_no_budget() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db").with_nodes(1));
        assert!(!PdbBuilder { cluster: &cluster }.is_needed());
    }
}

mod ingress_tests {
    use super::*;

    #[test]
    fn test_ingress_names_and_hosts() {
        let cluster = cluster(
            CrdbClusterBuilder::new("crdb", "db")
                .with_ui_ingress("ui.example.com")
                .with_sql_ingress("sql.example.com"),
        );
        let ui = IngressBuilder { cluster: &cluster, kind: IngressKind::Ui }.build().unwrap();
        assert_eq!(ui.name_any(), "ui-crdb");
        let sql = IngressBuilder { cluster: &cluster, kind: IngressKind::Sql }.build().unwrap();
        assert_eq!(sql.name_any(), "sql-crdb");
        let rule = &sql.spec.unwrap().rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("sql.example.com"));
    }

    #[test]
    fn test_unconfigured_ingress_fails_to_build() {
        let cluster = cluster(CrdbClusterBuilder::new("crdb", "db"));
        assert!(IngressBuilder { cluster: &cluster, kind: IngressKind::Ui }.build().is_err());
    }
}
