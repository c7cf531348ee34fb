//! Usage ledger repository.

use crate::error::MetadataResult;
use crate::models::UsageRow;
use async_trait::async_trait;
use folio_core::VersionKind;
use std::collections::HashSet;
use time::OffsetDateTime;

/// Keys referenced by one stored version snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMediaSet {
    pub version_id: String,
    pub kind: VersionKind,
    pub media_keys: Vec<String>,
}

/// Point-in-time view of every reference source, applied by a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub autosave_keys: Vec<String>,
    pub versions: Vec<VersionMediaSet>,
}

impl UsageSnapshot {
    /// Distinct keys across the draft and every version.
    pub fn distinct_keys(&self) -> HashSet<&str> {
        self.autosave_keys
            .iter()
            .chain(self.versions.iter().flat_map(|v| v.media_keys.iter()))
            .map(String::as_str)
            .collect()
    }
}

/// Result of applying a [`UsageSnapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Rows whose counters were zeroed before the rebuild.
    pub rows_reset: u64,
    /// Distinct keys written by the rebuild.
    pub keys_upserted: u64,
    /// Mapping rows inserted.
    pub mappings_written: u64,
    /// Mapping rows removed for versions that no longer exist.
    pub mappings_pruned: u64,
}

/// Result of syncing the autosave flag with the current draft.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutosaveSync {
    pub flagged: u64,
    pub cleared: u64,
}

/// Repository for per-key reference counters.
#[async_trait]
pub trait UsageRepo: Send + Sync {
    /// Get the usage row for a key.
    async fn get_usage(&self, media_key: &str) -> MetadataResult<Option<UsageRow>>;

    /// List every usage row ordered by key.
    async fn list_usage(&self) -> MetadataResult<Vec<UsageRow>>;

    /// Return the subset of `media_keys` that have a usage row.
    async fn existing_usage_keys(&self, media_keys: &[String]) -> MetadataResult<HashSet<String>>;

    /// Sample rows not seen since `older_than`, oldest first.
    async fn sample_stale_usage(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UsageRow>>;

    /// Set `in_autosave` for exactly `media_keys` and clear it everywhere else.
    ///
    /// Runs in a single transaction.
    async fn sync_autosave(
        &self,
        media_keys: &[String],
        now: OffsetDateTime,
    ) -> MetadataResult<AutosaveSync>;

    /// Zero every counter and flag, then apply `snapshot` in one transaction.
    ///
    /// Rows are never deleted by a rebuild. Version mappings are replaced for
    /// every version in the snapshot and pruned for versions not in it.
    async fn rebuild_usage(
        &self,
        snapshot: &UsageSnapshot,
        now: OffsetDateTime,
    ) -> MetadataResult<RebuildStats>;
}

/// Counter column backing a snapshot kind.
pub(crate) fn counter_column(kind: VersionKind) -> &'static str {
    match kind {
        VersionKind::Manual => "manual_refs",
        VersionKind::Published => "published_refs",
    }
}
