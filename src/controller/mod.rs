pub mod context;
pub mod director;
pub mod error;
pub mod reconciler;
pub mod status;
pub mod validation;

pub use context::{Context, OperatorConfig};
pub use director::{Observed, handles, observe, pick};
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{Outcome, error_policy, reconcile};
pub use status::StatusManager;
pub use validation::{MIN_NODES, validate_spec};
