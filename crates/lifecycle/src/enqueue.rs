//! Scheduling explicit asset removals for deletion after the grace period.

use crate::error::{LifecycleResult, with_timeout};
use crate::metrics;
use crate::state::Lifecycle;
use folio_core::MediaKey;
use serde::Serialize;
use time::OffsetDateTime;

/// Answer to a deletion request. `Retained` is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// Still referenced somewhere; nothing scheduled.
    Retained {
        media_key: String,
        in_autosave: bool,
        manual_refs: i64,
        published_refs: i64,
    },
    /// Scheduled; the GC may delete it once `not_before` has passed.
    Enqueued {
        media_key: String,
        #[serde(with = "time::serde::rfc3339")]
        not_before: OffsetDateTime,
    },
}

impl EnqueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retained { .. } => "retained",
            Self::Enqueued { .. } => "enqueued",
        }
    }
}

impl Lifecycle {
    /// Handle a user's removal of an asset from the draft.
    pub async fn enqueue_deletion(&self, media_key: &str) -> LifecycleResult<EnqueueOutcome> {
        self.enqueue_deletion_at(media_key, OffsetDateTime::now_utc())
            .await
    }

    pub async fn enqueue_deletion_at(
        &self,
        media_key: &str,
        now: OffsetDateTime,
    ) -> LifecycleResult<EnqueueOutcome> {
        let key = MediaKey::new(media_key)?;
        if !self.extractor.is_managed(&key) {
            return Err(folio_core::Error::InvalidMediaKey(format!(
                "{key} is outside the managed prefix '{}'",
                self.extractor.allowed_prefix()
            ))
            .into());
        }

        let usage = with_timeout(
            "get usage",
            self.timeout(),
            self.metadata.get_usage(key.as_str()),
        )
        .await?;

        // No ledger row means nothing has ever counted a reference to it.
        let outcome = match usage {
            Some(row) if row.is_referenced() => EnqueueOutcome::Retained {
                media_key: row.media_key,
                in_autosave: row.in_autosave,
                manual_refs: row.manual_refs,
                published_refs: row.published_refs,
            },
            _ => {
                let not_before = now + self.config.grace_period();
                with_timeout(
                    "upsert pending",
                    self.timeout(),
                    self.metadata.upsert_pending(key.as_str(), now, not_before),
                )
                .await?;
                EnqueueOutcome::Enqueued {
                    media_key: key.into_string(),
                    not_before,
                }
            }
        };

        metrics::ENQUEUE_OUTCOMES
            .with_label_values(&[outcome.as_str()])
            .inc();
        match &outcome {
            EnqueueOutcome::Retained {
                media_key,
                in_autosave,
                manual_refs,
                published_refs,
            } => tracing::info!(
                media_key = %media_key,
                in_autosave = *in_autosave,
                manual_refs = *manual_refs,
                published_refs = *published_refs,
                "Deletion request retained, key still referenced"
            ),
            EnqueueOutcome::Enqueued {
                media_key,
                not_before,
            } => tracing::info!(
                media_key = %media_key,
                not_before = %not_before,
                "Deletion scheduled"
            ),
        }
        Ok(outcome)
    }
}
