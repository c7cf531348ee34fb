//! Inspection and manual requeue of deletions that exhausted their attempts.

use crate::error::{LifecycleResult, with_timeout};
use crate::state::Lifecycle;
use folio_core::MediaKey;
use folio_metadata::models::DeadLetterRow;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterEntry {
    pub media_key: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub dead_lettered_at: OffsetDateTime,
}

impl From<DeadLetterRow> for DeadLetterEntry {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            media_key: row.media_key,
            attempts: row.attempts,
            last_error: row.last_error,
            requested_at: row.requested_at,
            dead_lettered_at: row.dead_lettered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequeueOutcome {
    pub media_key: String,
    pub requeued: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub not_before: Option<OffsetDateTime>,
}

impl Lifecycle {
    pub async fn list_dead_letters(&self, limit: u32) -> LifecycleResult<Vec<DeadLetterEntry>> {
        let rows = with_timeout(
            "list dead letters",
            self.timeout(),
            self.metadata.list_dead_letters(limit),
        )
        .await?;
        Ok(rows.into_iter().map(DeadLetterEntry::from).collect())
    }

    /// Return a dead-lettered key to the pending queue with a fresh attempt
    /// budget. The GC re-checks references before acting on it again.
    pub async fn requeue_dead_letter(&self, media_key: &str) -> LifecycleResult<RequeueOutcome> {
        self.requeue_dead_letter_at(media_key, OffsetDateTime::now_utc())
            .await
    }

    pub async fn requeue_dead_letter_at(
        &self,
        media_key: &str,
        now: OffsetDateTime,
    ) -> LifecycleResult<RequeueOutcome> {
        let key = MediaKey::new(media_key)?;
        let not_before = now + self.config.grace_period();
        let requeued = with_timeout(
            "requeue dead letter",
            self.timeout(),
            self.metadata
                .requeue_dead_letter(key.as_str(), now, not_before),
        )
        .await?;

        if requeued {
            tracing::info!(media_key = %key, not_before = %not_before, "Dead letter requeued");
        } else {
            tracing::warn!(media_key = %key, "No dead letter found for key");
        }
        Ok(RequeueOutcome {
            media_key: key.into_string(),
            requeued,
            not_before: requeued.then_some(not_before),
        })
    }
}
