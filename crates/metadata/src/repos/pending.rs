//! Pending-deletion queue repository.

use crate::error::MetadataResult;
use crate::models::PendingDeletionRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Result of finalising a successful physical deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    pub pending_removed: bool,
    pub usage_removed: bool,
    /// The usage row gained a reference while the object was being deleted.
    pub rereferenced: bool,
}

/// Repository for candidate keys awaiting deletion.
#[async_trait]
pub trait PendingDeletionRepo: Send + Sync {
    /// Insert or refresh a pending deletion, resetting its attempt count.
    async fn upsert_pending(
        &self,
        media_key: &str,
        requested_at: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> MetadataResult<()>;

    async fn get_pending(&self, media_key: &str) -> MetadataResult<Option<PendingDeletionRow>>;

    /// Due candidates, oldest `not_before` first.
    async fn due_pending(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<PendingDeletionRow>>;

    async fn count_pending(&self) -> MetadataResult<u64>;

    /// Remove a pending row. Returns true if a row was removed.
    async fn remove_pending(&self, media_key: &str) -> MetadataResult<bool>;

    /// Record a failed attempt and push `not_before` out.
    async fn reschedule_pending(
        &self,
        media_key: &str,
        checked_at: OffsetDateTime,
        not_before: OffsetDateTime,
        error: &str,
    ) -> MetadataResult<bool>;

    /// Remove the pending row and, if still unreferenced, the usage row.
    ///
    /// Runs in a single transaction.
    async fn complete_deletion(&self, media_key: &str) -> MetadataResult<ReclaimOutcome>;
}
