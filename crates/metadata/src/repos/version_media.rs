//! Version to media mapping repository.

use crate::error::MetadataResult;
use crate::models::VersionMediaRow;
use async_trait::async_trait;
use folio_core::VersionKind;
use time::OffsetDateTime;

/// Counter changes applied when a version's references are released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecrementOutcome {
    /// Keys whose counter was decremented.
    pub decremented: u64,
    /// Keys whose counter was already zero or whose row was missing.
    pub clamped: Vec<String>,
}

/// Repository for the version snapshot to media key join table.
#[async_trait]
pub trait VersionMediaRepo: Send + Sync {
    /// Keys mapped to a version.
    async fn version_media(&self, version_id: &str) -> MetadataResult<Vec<VersionMediaRow>>;

    /// Distinct version ids present in the mapping.
    async fn mapped_versions(&self) -> MetadataResult<Vec<String>>;

    /// Replace the mapping for a version and increment its counters.
    ///
    /// If the version was already recorded its previous references are
    /// released first, so re-recording never double counts. Runs in a single
    /// transaction.
    async fn record_version(
        &self,
        version_id: &str,
        kind: VersionKind,
        media_keys: &[String],
        now: OffsetDateTime,
    ) -> MetadataResult<DecrementOutcome>;

    /// Remove a version's mapping and decrement its counters, clamping at zero.
    async fn release_version(&self, version_id: &str) -> MetadataResult<DecrementOutcome>;
}
