//! Feature gates
//!
//! Gates are parsed once at startup from `FEATURE_GATES` (`Name=bool,...`) and
//! frozen into [`FeatureGates`], which is threaded through the controller
//! context. Tests construct their own value with [`FeatureGates::with`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Environment variable holding gate overrides
pub const FEATURE_GATES_ENV: &str = "FEATURE_GATES";

/// Operator features that can be switched off
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// Scale down through node decommissioning
    Decommission,
    /// Verify the binary version of the requested image before deploying
    CrdbVersionValidator,
    /// Expand persistent volume claims when the requested size grows
    ResizePvc,
    /// Reconcile child resources
    Deploy,
    /// Honour the restart annotation
    ClusterRestart,
    /// Delete volume claims left behind by removed nodes
    AutoPrunePvc,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Decommission,
        Feature::CrdbVersionValidator,
        Feature::ResizePvc,
        Feature::Deploy,
        Feature::ClusterRestart,
        Feature::AutoPrunePvc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Decommission => "Decommission",
            Feature::CrdbVersionValidator => "CrdbVersionValidator",
            Feature::ResizePvc => "ResizePVC",
            Feature::Deploy => "Deploy",
            Feature::ClusterRestart => "ClusterRestart",
            Feature::AutoPrunePvc => "AutoPrunePVC",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = FeatureGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| FeatureGateError::UnknownFeature(s.to_string()))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeatureGateError {
    #[error("unknown feature gate: {0}")]
    UnknownFeature(String),

    #[error("malformed feature gate entry '{0}', expected Name=true|false")]
    Malformed(String),
}

/// Immutable set of feature gate values. Every feature defaults to enabled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGates {
    overrides: BTreeMap<Feature, bool>,
}

impl FeatureGates {
    /// Parse a `Name=bool,...` list. Empty input yields the defaults.
    pub fn parse(input: &str) -> Result<Self, FeatureGateError> {
        let mut overrides = BTreeMap::new();
        for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| FeatureGateError::Malformed(entry.to_string()))?;
            let enabled: bool = value
                .trim()
                .parse()
                .map_err(|_| FeatureGateError::Malformed(entry.to_string()))?;
            overrides.insert(name.trim().parse::<Feature>()?, enabled);
        }
        Ok(Self { overrides })
    }

    /// Read gates from `FEATURE_GATES`
    pub fn from_env() -> Result<Self, FeatureGateError> {
        match std::env::var(FEATURE_GATES_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Return a copy with one gate overridden
    pub fn with(mut self, feature: Feature, enabled: bool) -> Self {
        self.overrides.insert(feature, enabled);
        self
    }

    pub fn enabled(&self, feature: Feature) -> bool {
        self.overrides.get(&feature).copied().unwrap_or(true)
    }
}
