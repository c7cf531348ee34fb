//! Saved version snapshots and their reference classes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference class of a stored version snapshot.
///
/// The live draft is tracked separately as a flag on the usage ledger; only
/// explicit snapshots carry a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionKind {
    /// A user-triggered saved snapshot.
    Manual,
    /// A snapshot released to readers.
    Published,
}

impl VersionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Published => "published",
        }
    }
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Self::Manual),
            "published" => Ok(Self::Published),
            other => Err(Error::InvalidVersionKind(other.to_string())),
        }
    }
}

/// Identifying metadata of one stored version snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRef {
    /// Stable version identifier.
    pub version_id: String,
    /// Reference class the snapshot counts towards.
    pub kind: VersionKind,
    /// Storage key of the snapshot body.
    pub storage_key: String,
}

impl VersionRef {
    pub fn new(
        version_id: impl Into<String>,
        kind: VersionKind,
        storage_key: impl Into<String>,
    ) -> Self {
        Self {
            version_id: version_id.into(),
            kind,
            storage_key: storage_key.into(),
        }
    }
}
