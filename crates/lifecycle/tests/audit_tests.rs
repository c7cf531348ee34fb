//! Orphan and missing-object reconciliation.

mod common;

use common::{MemoryDocuments, TestLifecycle, doc_with_images, t0, test_config};
use folio_core::MediaExtractor;
use folio_core::config::LifecycleConfig;
use folio_lifecycle::{Lifecycle, LifecycleError};
use folio_metadata::SqliteStore;
use bytes::Bytes;
use folio_storage::{FilesystemBackend, ObjectStore, StorageError};
use std::collections::BTreeSet;
use std::sync::Arc;
use time::Duration;

#[tokio::test]
async fn test_audit_reports_orphans_and_missing() {
    let t = TestLifecycle::new().await;
    let lc = &t.lifecycle;
    let now = t0();
    let long_ago = now - Duration::days(100);

    // Stale rows: one whose object is gone, one still present.
    lc.sync_autosave_at(
        &doc_with_images(&["ebooks/b1/gone.png", "ebooks/b1/old.png"]),
        long_ago,
    )
    .await
    .unwrap();
    lc.sync_autosave_at(&doc_with_images(&["ebooks/b1/live.png"]), now)
        .await
        .unwrap();

    for key in [
        "ebooks/b1/live.png",
        "ebooks/b1/old.png",
        "ebooks/b1/stray-1.png",
        "ebooks/b2/stray-2.png",
        "documents/draft.json",
    ] {
        t.storage.insert(key);
    }
    let pending_before = t.metadata.count_pending().await.unwrap();

    let report = lc.run_audit_at(now, None).await.unwrap();
    assert_eq!(
        report.orphans,
        vec!["ebooks/b1/stray-1.png".to_string(), "ebooks/b2/stray-2.png".to_string()]
    );
    assert_eq!(report.missing, vec!["ebooks/b1/gone.png".to_string()]);
    assert_eq!(report.orphan_count, 2);
    assert_eq!(report.missing_count, 1);
    assert_eq!(report.objects_listed, 4);
    assert_eq!(report.records_sampled, 2);
    assert_eq!(report.checked_count, 6);
    assert!(report.listing_complete);
    assert!(report.resume_token.is_none());

    // Read-only.
    assert!(t.storage.deletes().is_empty());
    assert_eq!(t.metadata.count_pending().await.unwrap(), pending_before);
    assert!(t.metadata.get_usage("ebooks/b1/gone.png").await.unwrap().is_some());
}

#[tokio::test]
async fn test_audit_resumes_bounded_listing() {
    let t = TestLifecycle::with_config(LifecycleConfig {
        audit_page_size: 2,
        audit_max_objects: 2,
        ..test_config()
    })
    .await;
    for i in 0..5 {
        t.storage.insert(&format!("ebooks/b1/orphan-{i}.png"));
    }

    let mut seen = BTreeSet::new();
    let mut token: Option<String> = None;
    let mut runs = 0;
    loop {
        let report = t.lifecycle.run_audit_at(t0(), token.as_deref()).await.unwrap();
        runs += 1;
        assert!(report.objects_listed <= 2);
        seen.extend(report.orphans);
        if report.listing_complete {
            assert!(report.resume_token.is_none());
            break;
        }
        token = report.resume_token;
        assert!(token.is_some());
        assert!(runs < 5, "listing never completed");
    }

    assert_eq!(runs, 3);
    assert_eq!(seen.len(), 5);
}

#[tokio::test]
async fn test_audit_listing_failure_midway_is_partial() {
    let t = TestLifecycle::with_config(LifecycleConfig {
        audit_page_size: 2,
        ..test_config()
    })
    .await;
    for i in 0..5 {
        t.storage.insert(&format!("ebooks/b1/orphan-{i}.png"));
    }
    t.storage.fail_listing_after(1);

    let report = t.lifecycle.run_audit_at(t0(), None).await.unwrap();
    assert_eq!(report.objects_listed, 2);
    assert_eq!(report.probe_errors, 1);
    assert!(!report.listing_complete);
    assert!(report.resume_token.is_some());
}

#[tokio::test]
async fn test_audit_rejects_garbage_resume_token() {
    let t = TestLifecycle::new().await;
    let err = t
        .lifecycle
        .run_audit_at(t0(), Some("not-a-token!"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Storage(StorageError::InvalidContinuationToken(_))
    ));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_audit_resume_on_filesystem_is_not_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FilesystemBackend::new(dir.path().join("media")).await.unwrap());
    let metadata = Arc::new(SqliteStore::new(dir.path().join("lifecycle.db")).await.unwrap());
    let lifecycle = Lifecycle::new(
        metadata,
        storage,
        Arc::new(MemoryDocuments::default()),
        MediaExtractor::new(common::CDN, "ebooks/", ["src"]),
        test_config(),
    );

    let err = lifecycle.run_audit_at(t0(), Some("abc")).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Storage(StorageError::ListingNotResumable)
    ));

    // Without a token the full listing works.
    let report = lifecycle.run_audit_at(t0(), None).await.unwrap();
    assert!(report.listing_complete);
    assert_eq!(report.checked_count, 0);
}

#[tokio::test]
async fn test_audit_reads_every_filesystem_page() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FilesystemBackend::new(dir.path().join("media")).await.unwrap());
    for i in 0..5 {
        storage
            .put(&format!("ebooks/b1/orphan-{i}.png"), Bytes::from_static(b"\x89PNG"))
            .await
            .unwrap();
    }
    let metadata = Arc::new(SqliteStore::new(dir.path().join("lifecycle.db")).await.unwrap());
    let lifecycle = Lifecycle::new(
        metadata,
        storage,
        Arc::new(MemoryDocuments::default()),
        MediaExtractor::new(common::CDN, "ebooks/", ["src"]),
        LifecycleConfig {
            audit_page_size: 2,
            audit_max_objects: 2,
            ..test_config()
        },
    );

    let report = lifecycle.run_audit_at(t0(), None).await.unwrap();
    assert_eq!(report.objects_listed, 5);
    assert_eq!(report.orphan_count, 5);
    assert!(report.listing_complete);
    assert!(report.resume_token.is_none());
}
