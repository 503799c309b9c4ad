#![allow(dead_code)]

//! Common test utilities and fixtures shared across test targets
//!
//! Include this module in a test target:
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```

mod fixtures;

pub use fixtures::*;
