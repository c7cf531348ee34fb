//! Batch garbage collection of due pending deletions.
//!
//! Each candidate is re-checked against the usage ledger immediately before
//! its object is touched. Presence in the queue only means the key looked
//! unreferenced when it was enqueued.

use crate::error::{FailureReason, LifecycleError, LifecycleResult, with_timeout};
use crate::metrics;
use crate::state::Lifecycle;
use folio_metadata::models::PendingDeletionRow;
use folio_storage::StorageError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use time::OffsetDateTime;

/// Per-key result of one GC pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Referenced again; dequeued, object untouched.
    Retained,
    /// Object deleted and queue row removed. `rereferenced` when a save
    /// counted the key again before the ledger cleanup ran.
    Deleted { rereferenced: bool },
    /// Deletion failed; rescheduled after the grace period.
    Retry(FailureReason),
    /// Deletion failed for the last allowed time; moved to dead letters.
    DeadLettered(FailureReason),
}

impl KeyOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Retained => "retained",
            Self::Deleted { .. } => "deleted",
            Self::Retry(_) => "retry",
            Self::DeadLettered(_) => "dead_lettered",
        }
    }
}

/// Summary of `RunGarbageCollectionBatch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcRunReport {
    pub checked: u64,
    pub deleted: u64,
    pub retained: u64,
    pub errors: u64,
    /// Subset of `errors` that exhausted their attempts.
    pub dead_lettered: u64,
    /// Keys re-referenced between the object delete and the ledger cleanup.
    pub rereferenced: u64,
    pub error_reasons: BTreeMap<FailureReason, u64>,
    pub duration_ms: u64,
    /// Counts describe what would have happened; nothing was mutated.
    pub dry_run: bool,
}

impl GcRunReport {
    fn record(&mut self, outcome: KeyOutcome) {
        self.checked += 1;
        match outcome {
            KeyOutcome::Retained => self.retained += 1,
            KeyOutcome::Deleted { rereferenced } => {
                self.deleted += 1;
                if rereferenced {
                    self.rereferenced += 1;
                }
            }
            KeyOutcome::Retry(reason) => self.record_error(reason),
            KeyOutcome::DeadLettered(reason) => {
                self.dead_lettered += 1;
                self.record_error(reason);
            }
        }
    }

    fn record_error(&mut self, reason: FailureReason) {
        self.errors += 1;
        *self.error_reasons.entry(reason).or_default() += 1;
    }
}

impl Lifecycle {
    /// Process at most `batch_size` due candidates, oldest `not_before` first.
    pub async fn run_gc_batch(&self) -> LifecycleResult<GcRunReport> {
        self.run_gc_batch_at(OffsetDateTime::now_utc(), self.config.dry_run)
            .await
    }

    /// Like [`run_gc_batch`](Self::run_gc_batch) with an explicit clock and mode.
    ///
    /// Failing to select the batch is fatal; every later failure is confined
    /// to its key.
    pub async fn run_gc_batch_at(
        &self,
        now: OffsetDateTime,
        dry_run: bool,
    ) -> LifecycleResult<GcRunReport> {
        let started = Instant::now();
        let batch_size = self.config.effective_batch_size();

        let due = with_timeout(
            "select due deletions",
            self.timeout(),
            self.metadata.due_pending(now, batch_size),
        )
        .await?;

        let mut report = GcRunReport {
            dry_run,
            ..Default::default()
        };
        for candidate in due.iter().take(batch_size as usize) {
            let outcome = self.process_candidate(candidate, now, dry_run).await;
            tracing::debug!(
                media_key = %candidate.media_key,
                outcome = outcome.label(),
                dry_run,
                "GC candidate processed"
            );
            if !dry_run {
                metrics::GC_KEYS.with_label_values(&[outcome.label()]).inc();
            }
            report.record(outcome);
        }

        let elapsed = started.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        metrics::observe_duration("gc", elapsed);

        let reasons = serde_json::to_string(&report.error_reasons).unwrap_or_default();
        if report.errors > 0 {
            tracing::warn!(
                checked = report.checked,
                deleted = report.deleted,
                retained = report.retained,
                errors = report.errors,
                dead_lettered = report.dead_lettered,
                error_reasons = %reasons,
                duration_ms = report.duration_ms,
                dry_run,
                "GC batch complete with errors"
            );
        } else {
            tracing::info!(
                checked = report.checked,
                deleted = report.deleted,
                retained = report.retained,
                rereferenced = report.rereferenced,
                duration_ms = report.duration_ms,
                dry_run,
                "GC batch complete"
            );
        }

        Ok(report)
    }

    async fn process_candidate(
        &self,
        candidate: &PendingDeletionRow,
        now: OffsetDateTime,
        dry_run: bool,
    ) -> KeyOutcome {
        let key = candidate.media_key.as_str();
        let timeout = self.timeout();

        // Re-verify: an edit since enqueue may have referenced the key again.
        let usage = match with_timeout("get usage", timeout, self.metadata.get_usage(key)).await {
            Ok(usage) => usage,
            Err(e) => return self.fail(candidate, now, e, dry_run).await,
        };
        if usage.as_ref().is_some_and(|row| row.is_referenced()) {
            if !dry_run
                && let Err(e) =
                    with_timeout("remove pending", timeout, self.metadata.remove_pending(key))
                        .await
            {
                // Harmless: the next run re-checks and retains again.
                tracing::warn!(media_key = %key, error = %e, "Failed to dequeue retained key");
            }
            return KeyOutcome::Retained;
        }

        if dry_run {
            return KeyOutcome::Deleted {
                rereferenced: false,
            };
        }

        match with_timeout("delete object", timeout, self.storage.delete(key)).await {
            Ok(()) => {}
            // Gone already, e.g. a previous run deleted it but failed the
            // ledger cleanup. The key is unreferenced, so finish the reclaim.
            Err(LifecycleError::Storage(StorageError::NotFound(_))) => {
                tracing::debug!(media_key = %key, "Object already absent, completing reclaim");
            }
            Err(e) => return self.fail(candidate, now, e, dry_run).await,
        }

        match with_timeout(
            "complete deletion",
            timeout,
            self.metadata.complete_deletion(key),
        )
        .await
        {
            Ok(reclaim) => {
                if reclaim.rereferenced {
                    metrics::GC_REREFERENCED.inc();
                    tracing::warn!(
                        media_key = %key,
                        "Key re-referenced during deletion, usage row kept"
                    );
                }
                KeyOutcome::Deleted {
                    rereferenced: reclaim.rereferenced,
                }
            }
            Err(e) => {
                // The object is gone but the queue row survived; the next
                // attempt finds it absent and retries the cleanup.
                tracing::error!(
                    media_key = %key,
                    error = %e,
                    "Object deleted but ledger cleanup failed"
                );
                self.fail(candidate, now, e, dry_run).await
            }
        }
    }

    /// Record a failed attempt: reschedule, or dead-letter once attempts run out.
    async fn fail(
        &self,
        candidate: &PendingDeletionRow,
        now: OffsetDateTime,
        err: LifecycleError,
        dry_run: bool,
    ) -> KeyOutcome {
        let key = candidate.media_key.as_str();
        let reason = FailureReason::classify(&err);
        let attempts = candidate.attempts.saturating_add(1);
        let message = format!("{reason}: {err}");

        if dry_run {
            return KeyOutcome::Retry(reason);
        }

        metrics::GC_ERRORS.with_label_values(&[reason.as_str()]).inc();

        if attempts >= self.config.max_attempts.min(i32::MAX as u32) as i32 {
            match with_timeout(
                "dead letter",
                self.timeout(),
                self.metadata.dead_letter(key, attempts, &message, now),
            )
            .await
            {
                Ok(false) => {
                    // Another run already settled this key.
                    tracing::debug!(media_key = %key, "Pending row gone before dead-lettering");
                    return KeyOutcome::Retry(reason);
                }
                Ok(true) => {
                    metrics::GC_DEAD_LETTERS.inc();
                    tracing::warn!(
                        media_key = %key,
                        attempts,
                        reason = %reason,
                        error = %err,
                        "Deletion dead-lettered after exhausting attempts"
                    );
                    return KeyOutcome::DeadLettered(reason);
                }
                Err(e) => {
                    tracing::error!(media_key = %key, error = %e, "Failed to dead-letter key");
                    return KeyOutcome::Retry(reason);
                }
            }
        }

        let not_before = now + self.config.grace_period();
        if let Err(e) = with_timeout(
            "reschedule pending",
            self.timeout(),
            self.metadata
                .reschedule_pending(key, now, not_before, &message),
        )
        .await
        {
            tracing::error!(media_key = %key, error = %e, "Failed to reschedule deletion");
        }
        tracing::debug!(
            media_key = %key,
            attempts,
            reason = %reason,
            error = %err,
            "Deletion failed, rescheduled"
        );
        KeyOutcome::Retry(reason)
    }
}
