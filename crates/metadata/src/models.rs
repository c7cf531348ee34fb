//! Database models mapping to the lifecycle schema.

use folio_core::VersionKind;
use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Usage ledger
// =============================================================================

/// Per-key reference counters and the autosave presence flag.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UsageRow {
    pub media_key: String,
    pub in_autosave: bool,
    pub manual_refs: i64,
    pub published_refs: i64,
    pub last_seen_at: OffsetDateTime,
}

impl UsageRow {
    /// Whether any reference class still needs the asset.
    pub fn is_referenced(&self) -> bool {
        self.in_autosave || self.manual_refs > 0 || self.published_refs > 0
    }
}

// =============================================================================
// Pending deletions
// =============================================================================

/// A key believed unreferenced at enqueue time, awaiting its grace period.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct PendingDeletionRow {
    pub media_key: String,
    pub requested_at: OffsetDateTime,
    pub not_before: OffsetDateTime,
    pub attempts: i32,
    pub last_checked_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

/// A key whose deletion exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DeadLetterRow {
    pub media_key: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub requested_at: OffsetDateTime,
    pub dead_lettered_at: OffsetDateTime,
}

// =============================================================================
// Version <-> media mapping
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct VersionMediaRow {
    pub version_id: String,
    pub media_key: String,
    pub version_kind: String,
}

impl VersionMediaRow {
    /// Parse the stored kind column.
    pub fn kind(&self) -> Option<VersionKind> {
        self.version_kind.parse().ok()
    }
}
