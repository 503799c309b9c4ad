mod crdb_cluster;

pub use crdb_cluster::*;
