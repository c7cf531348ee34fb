//! Full rebuild of the usage ledger from the draft and every stored snapshot.

use crate::error::{LifecycleResult, with_timeout};
use crate::ledger::sorted_keys;
use crate::metrics;
use crate::state::Lifecycle;
use folio_metadata::repos::{UsageSnapshot, VersionMediaSet};
use serde::Serialize;
use std::time::Instant;
use time::OffsetDateTime;

/// Outcome of `ReindexNow`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    /// Distinct managed keys referenced by the draft or any snapshot.
    pub keys_discovered: u64,
    /// Keys referenced by the live draft.
    pub autosave_keys: u64,
    /// Snapshots read.
    pub versions_scanned: u64,
    /// (version, key) references written to the mapping.
    pub version_references: u64,
    /// Existing usage rows whose counters were reset before recounting.
    pub rows_reset: u64,
    /// Mapping rows removed for versions that no longer exist.
    pub mappings_pruned: u64,
    pub duration_ms: u64,
}

impl Lifecycle {
    /// Rebuild counters, flags and the version mapping from source content.
    ///
    /// Every document is read before the ledger is touched; a read failure
    /// aborts the run and leaves the ledger as it was. The rebuild itself is
    /// applied in one transaction.
    pub async fn reindex_now(&self) -> LifecycleResult<ReindexReport> {
        self.reindex_now_at(OffsetDateTime::now_utc()).await
    }

    pub async fn reindex_now_at(&self, now: OffsetDateTime) -> LifecycleResult<ReindexReport> {
        let started = Instant::now();
        let timeout = self.timeout();

        let draft = with_timeout("load draft", timeout, self.documents.load_draft()).await?;
        let autosave_keys = match &draft {
            Some(content) => sorted_keys(self.extractor.extract(content)),
            None => {
                tracing::info!("No draft saved yet, autosave flags will all be cleared");
                Vec::new()
            }
        };

        let versions = with_timeout("list versions", timeout, self.documents.list_versions()).await?;
        let mut sets = Vec::with_capacity(versions.len());
        for version in &versions {
            let content =
                with_timeout("load version", timeout, self.documents.load_version(version))
                    .await
                    .inspect_err(|e| {
                        tracing::error!(
                            version_id = %version.version_id,
                            error = %e,
                            "Failed to read version, aborting reindex without changes"
                        );
                    })?;
            sets.push(VersionMediaSet {
                version_id: version.version_id.clone(),
                kind: version.kind,
                media_keys: sorted_keys(self.extractor.extract(&content)),
            });
        }

        let snapshot = UsageSnapshot {
            autosave_keys,
            versions: sets,
        };
        let keys_discovered = snapshot.distinct_keys().len() as u64;

        let stats = with_timeout(
            "rebuild usage",
            timeout,
            self.metadata.rebuild_usage(&snapshot, now),
        )
        .await?;

        let elapsed = started.elapsed();
        let report = ReindexReport {
            keys_discovered,
            autosave_keys: snapshot.autosave_keys.len() as u64,
            versions_scanned: snapshot.versions.len() as u64,
            version_references: stats.mappings_written,
            rows_reset: stats.rows_reset,
            mappings_pruned: stats.mappings_pruned,
            duration_ms: elapsed.as_millis() as u64,
        };

        metrics::REINDEX_KEYS.set(keys_discovered as i64);
        metrics::observe_duration("reindex", elapsed);
        tracing::info!(
            keys_discovered = report.keys_discovered,
            autosave_keys = report.autosave_keys,
            versions_scanned = report.versions_scanned,
            version_references = report.version_references,
            rows_reset = report.rows_reset,
            mappings_pruned = report.mappings_pruned,
            duration_ms = report.duration_ms,
            "Reindex complete"
        );
        Ok(report)
    }
}
