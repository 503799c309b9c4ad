// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the CockroachDB operator
//!
//! This module contains unit tests for:
//! - Child object builders (StatefulSet, Services, PDB, Ingress, RBAC)
//! - Spec validation
//! - The condition and action ledger
//! - Action selection
//! - Version arithmetic and claim pruning

#[path = "../common/mod.rs"]
mod common;

mod director;
mod resources;
mod status;
mod update;
mod validation;
