//! Schema version tags carried by NDM custom resources.
//!
//! Every `BlockDevice` and `BlockDeviceClaim` records the schema revision it
//! conforms to in the [`VERSION_LABEL`] label. Objects written before the label
//! existed have none and are read as [`Version::legacy`].

use std::fmt;

use anyhow::Result;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::NdmError;

/// Label holding the schema version of a custom resource.
pub const VERSION_LABEL: &str = "openebs.io/version";

/// A totally ordered schema version (semantic version).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(semver::Version);

impl Version {
    /// Parse a version string, accepting an optional leading `v`.
    pub fn parse(version: &str) -> Result<Self> {
        let trimmed = version.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        semver::Version::parse(bare)
            .map(Self)
            .map_err(|_| NdmError::InvalidVersion(version.to_string()).into())
    }

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Version assumed for resources that carry no version label.
    pub const fn legacy() -> Self {
        Self::new(0, 4, 0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read the schema version recorded on an object.
pub fn version_of(meta: &ObjectMeta) -> Result<Version> {
    match meta.labels.as_ref().and_then(|l| l.get(VERSION_LABEL)) {
        Some(value) => Version::parse(value),
        None => Ok(Version::legacy()),
    }
}

/// Stamp `version` onto an object, replacing any previous value.
pub fn set_version(meta: &mut ObjectMeta, version: &Version) {
    meta.labels
        .get_or_insert_with(Default::default)
        .insert(VERSION_LABEL.to_string(), version.to_string());
}
