//! Dead-letter repository for deletions that exhausted their retries.

use crate::error::MetadataResult;
use crate::models::DeadLetterRow;
use async_trait::async_trait;
use time::OffsetDateTime;

#[async_trait]
pub trait DeadLetterRepo: Send + Sync {
    /// Move a pending row into the dead-letter table with its final attempt count.
    ///
    /// Returns false if no pending row existed.
    async fn dead_letter(
        &self,
        media_key: &str,
        attempts: i32,
        last_error: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    async fn list_dead_letters(&self, limit: u32) -> MetadataResult<Vec<DeadLetterRow>>;

    /// Move a dead letter back into the pending queue with a fresh attempt count.
    ///
    /// Returns false if the key was not dead-lettered.
    async fn requeue_dead_letter(
        &self,
        media_key: &str,
        now: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> MetadataResult<bool>;
}
