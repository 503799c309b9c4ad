//! Database image whitelist
//!
//! The operator only deploys versions it was released against. Each allowed
//! version arrives as an environment variable
//! `RELATED_IMAGE_COCKROACH_v<major>_<minor>_<patch>` whose value is the image
//! to run for that version.

use std::collections::BTreeMap;

use semver::Version;

/// Prefix of the whitelist environment variables
pub const RELATED_IMAGE_PREFIX: &str = "RELATED_IMAGE_COCKROACH_";

/// Read-only map from release version (`v24.1.0`) to image reference
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionWhitelist {
    images: BTreeMap<String, String>,
}

impl VersionWhitelist {
    /// Build from `(name, value)` pairs, ignoring anything that is not a
    /// whitelist variable
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let images = vars
            .into_iter()
            .filter_map(|(k, v)| {
                let suffix = k.as_ref().strip_prefix(RELATED_IMAGE_PREFIX)?;
                let version = version_from_env_suffix(suffix)?;
                let image = v.as_ref().trim();
                (!image.is_empty()).then(|| (version, image.to_string()))
            })
            .collect();
        Self { images }
    }

    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Image registered for a version, accepting the version with or
    /// without a leading `v`
    pub fn image_for(&self, version: &str) -> Option<&str> {
        self.images
            .get(&normalize(version))
            .map(String::as_str)
    }

    pub fn contains(&self, version: &str) -> bool {
        self.images.contains_key(&normalize(version))
    }

    /// Registered versions in ascending semantic order
    pub fn versions(&self) -> Vec<&str> {
        let mut versions: Vec<&str> = self.images.keys().map(String::as_str).collect();
        versions.sort_by_key(|v| Version::parse(v.trim_start_matches('v')).ok());
        versions
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

fn normalize(version: &str) -> String {
    let trimmed = version.trim();
    if trimmed.starts_with('v') {
        trimmed.to_string()
    } else {
        format!("v{trimmed}")
    }
}

/// `v24_1_0` becomes `v24.1.0`
fn version_from_env_suffix(suffix: &str) -> Option<String> {
    let dotted = suffix.trim_start_matches('v').replace('_', ".");
    let parsed = Version::parse(&dotted).ok()?;
    Some(format!("v{parsed}"))
}
