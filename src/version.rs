//! Cache version identifiers and the cache names derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque version string. Bump it whenever the asset set changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheVersion(String);

impl CacheVersion {
    /// Creates a version, rejecting empty strings, whitespace and path separators.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidVersion`] if the string cannot be used in a cache name.
    pub fn new(version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        let valid = !version.is_empty()
            && !version
                .chars()
                .any(|c| c.is_whitespace() || c == '/' || c == '\\');
        if valid {
            Ok(Self(version))
        } else {
            Err(Error::InvalidVersion(version))
        }
    }

    /// Returns the version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the cache name for this version: `"{prefix}-{version}"`.
    #[must_use]
    pub fn cache_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.0)
    }

    /// Returns the next patch version, keeping a leading `v` if present.
    ///
    /// `v1.0.0` becomes `v1.0.1`; `2.3.9` becomes `2.3.10`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidVersion`] if the version is not `[v]MAJOR.MINOR.PATCH`.
    pub fn bump_patch(&self) -> Result<Self> {
        let (prefix, rest) = self
            .0
            .strip_prefix('v')
            .map_or(("", self.0.as_str()), |rest| ("v", rest));
        let mut parsed =
            semver::Version::parse(rest).map_err(|_| Error::InvalidVersion(self.0.clone()))?;
        parsed.patch += 1;
        parsed.pre = semver::Prerelease::EMPTY;
        parsed.build = semver::BuildMetadata::EMPTY;
        Ok(Self(format!("{prefix}{parsed}")))
    }
}

impl Default for CacheVersion {
    fn default() -> Self {
        Self("v1.0.0".to_string())
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CacheVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for CacheVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CacheVersion> for String {
    fn from(version: CacheVersion) -> Self {
        version.0
    }
}
