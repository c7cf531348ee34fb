//! Read-only reconciliation of blob storage against the usage ledger.
//!
//! Orphans: objects under the managed prefix with no usage row.
//! Missing: usage rows not seen recently whose object no longer exists.
//! Neither direction mutates anything; findings are reported for review.

use crate::error::{LifecycleError, LifecycleResult, with_timeout};
use crate::metrics;
use crate::state::Lifecycle;
use folio_core::MediaKey;
use folio_storage::{ContinuationToken, ListingOptions, ListingResume, StorageError};
use futures::StreamExt;
use serde::Serialize;
use std::time::Instant;
use time::OffsetDateTime;

/// Findings of `RunAudit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Orphaned keys, capped at `audit_max_reported`.
    pub orphans: Vec<String>,
    /// Missing keys, capped at `audit_max_reported`.
    pub missing: Vec<String>,
    pub orphan_count: u64,
    pub missing_count: u64,
    /// Objects listed plus usage records probed.
    pub checked_count: u64,
    pub objects_listed: u64,
    /// Stale usage rows whose object was probed.
    pub records_sampled: u64,
    pub probe_errors: u64,
    /// False when the listing stopped early; see `resume_token`.
    pub listing_complete: bool,
    /// Pass back to continue the listing where this run stopped.
    pub resume_token: Option<String>,
    pub duration_ms: u64,
}

impl AuditReport {
    fn push_capped(list: &mut Vec<String>, key: String, cap: usize) {
        if list.len() < cap {
            list.push(key);
        }
    }
}

impl Lifecycle {
    /// Compare storage against the ledger in both directions.
    ///
    /// `resume_token` continues a listing a previous run stopped early. It is
    /// rejected on backends that cannot resume.
    pub async fn run_audit(&self, resume_token: Option<&str>) -> LifecycleResult<AuditReport> {
        self.run_audit_at(OffsetDateTime::now_utc(), resume_token)
            .await
    }

    pub async fn run_audit_at(
        &self,
        now: OffsetDateTime,
        resume_token: Option<&str>,
    ) -> LifecycleResult<AuditReport> {
        let started = Instant::now();
        let mut report = AuditReport::default();

        self.scan_orphans(resume_token, &mut report).await?;
        self.probe_missing(now, &mut report).await?;

        report.checked_count = report.objects_listed + report.records_sampled;
        let elapsed = started.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        metrics::AUDIT_ORPHANS.set(report.orphan_count as i64);
        metrics::AUDIT_MISSING.set(report.missing_count as i64);
        metrics::observe_duration("audit", elapsed);

        tracing::info!(
            orphan_count = report.orphan_count,
            missing_count = report.missing_count,
            checked_count = report.checked_count,
            objects_listed = report.objects_listed,
            records_sampled = report.records_sampled,
            probe_errors = report.probe_errors,
            listing_complete = report.listing_complete,
            duration_ms = report.duration_ms,
            "Audit complete"
        );
        Ok(report)
    }

    async fn scan_orphans(
        &self,
        resume_token: Option<&str>,
        report: &mut AuditReport,
    ) -> LifecycleResult<()> {
        let timeout = self.timeout();
        let prefix = self.extractor.allowed_prefix().to_string();
        let caps = self.storage.listing_capabilities();
        let max_objects = self.config.audit_max_objects;
        let max_reported = self.config.audit_max_reported;

        let resume = match resume_token {
            Some(_) if !caps.resumable => {
                return Err(StorageError::ListingNotResumable.into());
            }
            Some(encoded) => Some(ListingResume::new(ContinuationToken::from_base64(encoded)?)),
            None => None,
        };

        let mut pages = self.storage.list_pages(
            &prefix,
            ListingOptions::new(self.config.audit_page_size),
            resume,
        );
        let mut page_count = 0u64;
        // Token that would re-read the page after the last one processed.
        let mut last_token = resume_token.map(str::to_string);
        report.listing_complete = true;

        loop {
            let next = match tokio::time::timeout(timeout, pages.next()).await {
                Ok(next) => next,
                Err(_) => Some(Err(StorageError::Timeout(format!(
                    "listing page under {prefix}"
                )))),
            };
            let page = match next {
                None => break,
                Some(Ok(page)) => page,
                // Nothing was listed: the run as a whole cannot proceed.
                Some(Err(e)) if page_count == 0 => {
                    return Err(match e {
                        StorageError::Timeout(_) => LifecycleError::Timeout {
                            operation: "list storage",
                            timeout,
                        },
                        other => other.into(),
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        pages = page_count,
                        objects_listed = report.objects_listed,
                        error = %e,
                        "Listing page failed, stopping orphan scan"
                    );
                    report.probe_errors += 1;
                    report.listing_complete = false;
                    report.resume_token = last_token.filter(|_| caps.resumable);
                    return Ok(());
                }
            };

            page_count += 1;
            metrics::STORAGE_LISTING_PAGES
                .with_label_values(&[self.storage.backend_name()])
                .inc();

            let keys: Vec<String> = page
                .keys
                .into_iter()
                .filter(|raw| match MediaKey::new(raw.as_str()) {
                    Ok(key) => self.extractor.is_managed(&key),
                    Err(e) => {
                        tracing::debug!(key = %raw, error = %e, "Skipping unmanaged object");
                        false
                    }
                })
                .collect();
            report.objects_listed += keys.len() as u64;

            if !keys.is_empty() {
                let known = with_timeout(
                    "lookup usage keys",
                    timeout,
                    self.metadata.existing_usage_keys(&keys),
                )
                .await?;
                for key in keys {
                    if !known.contains(&key) {
                        tracing::debug!(media_key = %key, "Orphaned object");
                        report.orphan_count += 1;
                        AuditReport::push_capped(&mut report.orphans, key, max_reported);
                    }
                }
            }

            let Some(encoded) = page.next_token.map(|token| token.to_base64()) else {
                // Last page, or a backend that cannot resume: listings
                // without tokens run to the end and ignore the object cap.
                continue;
            };
            if report.objects_listed >= max_objects {
                tracing::info!(
                    objects_listed = report.objects_listed,
                    max_objects,
                    "Audit listing limit reached, re-run with the resume token to continue"
                );
                report.listing_complete = false;
                report.resume_token = Some(encoded);
                break;
            }
            last_token = Some(encoded);
        }

        Ok(())
    }

    async fn probe_missing(
        &self,
        now: OffsetDateTime,
        report: &mut AuditReport,
    ) -> LifecycleResult<()> {
        let timeout = self.timeout();
        let cutoff = now - self.config.audit_stale_after();
        let stale = with_timeout(
            "sample stale usage",
            timeout,
            self.metadata
                .sample_stale_usage(cutoff, self.config.audit_sample_size),
        )
        .await?;

        for row in stale {
            report.records_sampled += 1;
            match with_timeout("probe object", timeout, self.storage.exists(&row.media_key)).await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(media_key = %row.media_key, "Usage record without object");
                    report.missing_count += 1;
                    AuditReport::push_capped(
                        &mut report.missing,
                        row.media_key,
                        self.config.audit_max_reported,
                    );
                }
                Err(e) => {
                    tracing::warn!(media_key = %row.media_key, error = %e, "Existence probe failed");
                    report.probe_errors += 1;
                }
            }
        }
        Ok(())
    }
}
