//! Version transitions and the preserve-downgrade guard
//!
//! Only three transitions are supported: a patch within one major release, a
//! roll forward by exactly one major release and a roll back by exactly one.
//! Major releases are `YY.N`; the step after `YY.2` may be `YY+1.1` because
//! the second release of a year is optional to install.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

use crate::update::UpdateError;

static PRESERVE_DOWNGRADE_OPTION: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[0-9][0-9]\.[0-9]$").expect("valid preserve downgrade regex")
});

/// Major release of a version, `24.1` for `v24.1.5`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MajorVersion {
    pub year: u64,
    pub release: u64,
}

impl MajorVersion {
    pub fn of(version: &Version) -> Self {
        Self {
            year: version.major,
            release: version.minor,
        }
    }
}

impl fmt::Display for MajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.year, self.release)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    Patch,
    MajorUpgrade,
    MajorRollback,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Patch => "PATCH",
            UpdateKind::MajorUpgrade => "MAJOR_UPGRADE",
            UpdateKind::MajorRollback => "MAJOR_ROLLBACK",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse `v24.1.0` or `24.1.0`
pub fn parse_version(version: &str) -> Result<Version, UpdateError> {
    let trimmed = version.trim();
    Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed)).map_err(|e| {
        UpdateError::InvalidVersion {
            version: version.to_string(),
            reason: e.to_string(),
        }
    })
}

pub fn is_patch(want: &Version, current: &Version) -> bool {
    MajorVersion::of(want) == MajorVersion::of(current)
}

/// `a` is the release right after `b`
fn is_next_major(a: MajorVersion, b: MajorVersion) -> bool {
    (a.year == b.year && a.release == b.release + 1)
        || (a.year == b.year + 1 && b.release.checked_sub(1) == Some(a.release))
}

pub fn is_forward_one_major(want: &Version, current: &Version) -> bool {
    is_next_major(MajorVersion::of(want), MajorVersion::of(current))
}

pub fn is_back_one_major(want: &Version, current: &Version) -> bool {
    is_next_major(MajorVersion::of(current), MajorVersion::of(want))
}

/// Classify a transition, rejecting anything but the three supported kinds
pub fn classify(current: &Version, want: &Version) -> Result<UpdateKind, UpdateError> {
    if is_patch(want, current) {
        Ok(UpdateKind::Patch)
    } else if is_forward_one_major(want, current) {
        Ok(UpdateKind::MajorUpgrade)
    } else if is_back_one_major(want, current) {
        Ok(UpdateKind::MajorRollback)
    } else {
        Err(UpdateError::not_allowed(
            current,
            want,
            None,
            "only patches, rolling forward one major version, & rolling back one major version supported",
        ))
    }
}

pub fn is_valid_preserve_downgrade_option(value: &str) -> bool {
    PRESERVE_DOWNGRADE_OPTION.is_match(value)
}

/// Parse the setting value; an empty value means the option is unset
pub fn parse_preserve_downgrade(value: &str) -> Result<Option<MajorVersion>, UpdateError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || UpdateError::InvalidPreserveDowngrade(value.to_string());
    if !is_valid_preserve_downgrade_option(value) {
        return Err(invalid());
    }
    let (year, release) = value.split_once('.').ok_or_else(invalid)?;
    Ok(Some(MajorVersion {
        year: year.parse().map_err(|_| invalid())?,
        release: release.parse().map_err(|_| invalid())?,
    }))
}

/// Whether the preserve-downgrade option permits the transition
///
/// Rolling forward requires the option to be unset or to hold the current
/// release. Rolling back requires it to hold the target release, otherwise
/// the upgrade has already been finalized.
pub fn check_preserve_downgrade(
    kind: UpdateKind,
    current: &Version,
    want: &Version,
    preserve: Option<MajorVersion>,
) -> Result<(), UpdateError> {
    match kind {
        UpdateKind::Patch => Ok(()),
        UpdateKind::MajorUpgrade => match preserve {
            Some(p) if p != MajorVersion::of(current) => Err(UpdateError::not_allowed(
                current,
                want,
                Some(p),
                "can't roll forward due to preserve downgrade option",
            )),
            _ => Ok(()),
        },
        UpdateKind::MajorRollback => {
            if preserve == Some(MajorVersion::of(want)) {
                Ok(())
            } else {
                Err(UpdateError::not_allowed(
                    current,
                    want,
                    preserve,
                    "can't rollback since release already finalized",
                ))
            }
        }
    }
}

/// Value written before a major upgrade so the cluster can still roll back
pub fn downgrade_option_for(current: &Version) -> Result<String, UpdateError> {
    let value = MajorVersion::of(current).to_string();
    if is_valid_preserve_downgrade_option(&value) {
        Ok(value)
    } else {
        Err(UpdateError::InvalidPreserveDowngrade(value))
    }
}

/// Repository part of an image reference; digests are kept whole
pub fn image_name_without_version(image: &str) -> &str {
    if image.contains("@sha256") {
        return image;
    }
    // A colon before the last slash belongs to a registry port
    match image.rfind(':') {
        Some(i) if !image[i..].contains('/') => &image[..i],
        _ => image,
    }
}

/// Image reference for a version, leaving digest references untouched
pub fn target_image(image_name: &str, version: &str) -> String {
    if image_name.contains("@sha256") {
        image_name.to_string()
    } else {
        format!("{image_name}:{version}")
    }
}
