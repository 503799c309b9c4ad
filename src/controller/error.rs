//! Error types for the CrdbCluster controller

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::actor::ActorError;
use crate::features::FeatureGateError;
use crate::resources::ResourceError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ActionError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Action {action} failed: {source}")]
    ActionError {
        action: &'static str,
        #[source]
        source: ActorError,
    },

    #[error("Conflict persisted after {0} attempts")]
    ConflictError(u32),
}

impl From<FeatureGateError> for Error {
    fn from(e: FeatureGateError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::Kube(e) => Error::KubeError(e),
            ResourceError::Serialization(e) => Error::SerializationError(e),
            invalid @ ResourceError::InvalidSpec { .. } => Error::ValidationError(invalid.to_string()),
        }
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => is_retryable_kube_error(e),
            Error::ActionError { source, .. } => source.is_retryable(),
            Error::ConflictError(_) => true,
            Error::NotFound(_) => true,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::InvalidConfig(_) => false,
            Error::ValidationError(_) => false,
        }
    }

    /// Whether the error means the object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }
}

/// 4xx errors other than 409 Conflict and 429 TooManyRequests are not
/// retryable, everything else is.
pub fn is_retryable_kube_error(e: &kube::Error) -> bool {
    match e {
        kube::Error::Api(api_err) => {
            let code = api_err.code;
            if (400..500).contains(&code) {
                return code == 409 || code == 429;
            }
            true
        }
        _ => true,
    }
}

/// Whether a kube error is a 404
pub fn is_kube_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(api_err) if api_err.code == 404)
}

/// Whether a kube error is a 409
pub fn is_kube_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(api_err) if api_err.code == 409)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Backoff used for short polling loops inside actions
    pub fn polling(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            multiplier: 1.5,
            jitter: 0.1,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Past this the base delay is capped anyway, and larger exponents
        // overflow to infinity
        let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Run `op` until it succeeds, returns an error `should_retry` rejects, or
    /// the next attempt would start after `max_elapsed`. The last error is
    /// returned when time runs out.
    pub async fn retry<T, E, F, Fut>(
        &self,
        max_elapsed: Duration,
        mut op: F,
        should_retry: impl Fn(&E) -> bool,
    ) -> std::result::Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let start = tokio::time::Instant::now();
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let delay = self.delay_for_attempt(attempt);
            if !should_retry(&err) || start.elapsed() + delay > max_elapsed {
                return Err(err);
            }
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
