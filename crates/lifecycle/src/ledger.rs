//! Incremental usage-ledger maintenance driven by content saves.

use crate::error::{LifecycleResult, with_timeout};
use crate::metrics;
use crate::state::Lifecycle;
use folio_core::{MediaKey, VersionRef};
use folio_metadata::repos::{AutosaveSync, DecrementOutcome};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use time::OffsetDateTime;

/// Effect of recording or releasing one version snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionUpdate {
    pub version_id: String,
    /// Keys now mapped to the version (0 after a release).
    pub media_keys: usize,
    /// Counter decrements applied for the previous mapping.
    pub released: u64,
    /// Keys whose counter was already zero when decremented.
    pub clamped: Vec<String>,
}

/// Deterministic key list for ledger writes.
pub(crate) fn sorted_keys(keys: HashSet<MediaKey>) -> Vec<String> {
    let mut keys: Vec<String> = keys.into_iter().map(MediaKey::into_string).collect();
    keys.sort();
    keys
}

fn report_clamps(version_id: &str, outcome: &DecrementOutcome) {
    if outcome.clamped.is_empty() {
        return;
    }
    metrics::COUNTER_CLAMPS.inc_by(outcome.clamped.len() as u64);
    for key in &outcome.clamped {
        tracing::warn!(
            version_id = %version_id,
            media_key = %key,
            "Counter clamp: decrement on a zero reference count"
        );
    }
}

impl Lifecycle {
    /// Mirror the draft's references into the `in_autosave` flags.
    pub async fn sync_autosave(&self, draft: &Value) -> LifecycleResult<AutosaveSync> {
        self.sync_autosave_at(draft, OffsetDateTime::now_utc()).await
    }

    pub async fn sync_autosave_at(
        &self,
        draft: &Value,
        now: OffsetDateTime,
    ) -> LifecycleResult<AutosaveSync> {
        let keys = sorted_keys(self.extractor.extract(draft));
        let sync = with_timeout(
            "sync autosave",
            self.timeout(),
            self.metadata.sync_autosave(&keys, now),
        )
        .await?;

        tracing::debug!(
            keys = keys.len(),
            flagged = sync.flagged,
            cleared = sync.cleared,
            "Autosave references synchronised"
        );
        Ok(sync)
    }

    /// Count a created or published snapshot's references.
    ///
    /// Re-recording a version replaces its previous mapping instead of
    /// counting twice.
    pub async fn record_version(
        &self,
        version: &VersionRef,
        content: &Value,
    ) -> LifecycleResult<VersionUpdate> {
        self.record_version_at(version, content, OffsetDateTime::now_utc())
            .await
    }

    pub async fn record_version_at(
        &self,
        version: &VersionRef,
        content: &Value,
        now: OffsetDateTime,
    ) -> LifecycleResult<VersionUpdate> {
        let keys = sorted_keys(self.extractor.extract(content));
        let released = with_timeout(
            "record version",
            self.timeout(),
            self.metadata
                .record_version(&version.version_id, version.kind, &keys, now),
        )
        .await?;
        report_clamps(&version.version_id, &released);

        tracing::debug!(
            version_id = %version.version_id,
            kind = %version.kind,
            keys = keys.len(),
            released = released.decremented,
            "Version references recorded"
        );
        Ok(VersionUpdate {
            version_id: version.version_id.clone(),
            media_keys: keys.len(),
            released: released.decremented,
            clamped: released.clamped,
        })
    }

    /// Drop a deleted or superseded snapshot's references using its mapping.
    pub async fn release_version(&self, version_id: &str) -> LifecycleResult<VersionUpdate> {
        let released = with_timeout(
            "release version",
            self.timeout(),
            self.metadata.release_version(version_id),
        )
        .await?;
        report_clamps(version_id, &released);

        tracing::debug!(
            version_id = %version_id,
            released = released.decremented,
            "Version references released"
        );
        Ok(VersionUpdate {
            version_id: version_id.to_string(),
            media_keys: 0,
            released: released.decremented,
            clamped: released.clamped,
        })
    }
}
