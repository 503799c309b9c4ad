//! Certificate generation for secure clusters

pub mod certs;

pub use certs::*;
