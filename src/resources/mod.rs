pub mod cluster_sql;
pub mod common;
pub mod database;
pub mod exec;
pub mod ingress;
pub mod job;
pub mod pdb;
pub mod port_forward;
pub mod rbac;
pub mod reconcile;
pub mod service;
pub mod statefulset;
pub mod tls_secret;

pub use common::{FIELD_MANAGER, owner_reference, standard_labels};
pub use reconcile::{Builder, Persister, ResourceError};
