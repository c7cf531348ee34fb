//! Deletion requests: validation, retention and scheduling.

mod common;

use common::{TestLifecycle, doc_with_images, minutes, t0};
use folio_core::{VersionKind, VersionRef};
use folio_lifecycle::{EnqueueOutcome, LifecycleError};

#[tokio::test]
async fn test_unknown_key_is_enqueued() {
    let t = TestLifecycle::new().await;
    let now = t0();

    let outcome = t
        .lifecycle
        .enqueue_deletion_at("ebooks/b1/never-seen.png", now)
        .await
        .unwrap();
    assert_eq!(outcome.as_str(), "enqueued");

    let row = t
        .metadata
        .get_pending("ebooks/b1/never-seen.png")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.requested_at, now);
    assert_eq!(row.not_before, now + minutes(15));
    assert_eq!(row.attempts, 0);
}

#[tokio::test]
async fn test_published_reference_retains() {
    let t = TestLifecycle::new().await;
    let published = VersionRef::new(
        "p1",
        VersionKind::Published,
        "documents/versions/published/p1.json",
    );
    t.lifecycle
        .record_version_at(&published, &doc_with_images(&["ebooks/b1/a.png"]), t0())
        .await
        .unwrap();

    let outcome = t
        .lifecycle
        .enqueue_deletion_at("ebooks/b1/a.png", t0())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        EnqueueOutcome::Retained {
            published_refs: 1,
            manual_refs: 0,
            in_autosave: false,
            ..
        }
    ));
    assert_eq!(t.metadata.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_repeat_request_refreshes_schedule() {
    let t = TestLifecycle::new().await;
    let key = "ebooks/b1/a.png";

    t.lifecycle.enqueue_deletion_at(key, t0()).await.unwrap();
    let later = t0() + minutes(30);
    let outcome = t.lifecycle.enqueue_deletion_at(key, later).await.unwrap();

    assert_eq!(
        outcome,
        EnqueueOutcome::Enqueued {
            media_key: key.to_string(),
            not_before: later + minutes(15),
        }
    );
    assert_eq!(t.metadata.count_pending().await.unwrap(), 1);
    let row = t.metadata.get_pending(key).await.unwrap().unwrap();
    assert_eq!(row.not_before, later + minutes(15));
}

#[tokio::test]
async fn test_invalid_and_unmanaged_keys_are_rejected() {
    let t = TestLifecycle::new().await;

    for bad in ["", "/ebooks/a.png", "ebooks/../etc/passwd", "other/a.png"] {
        let err = t.lifecycle.enqueue_deletion_at(bad, t0()).await.unwrap_err();
        assert!(
            matches!(err, LifecycleError::Core(_)),
            "{bad:?} gave {err:?}"
        );
        assert!(!err.is_fatal());
        assert_eq!(err.code(), "invalid_request");
    }
    assert_eq!(t.metadata.count_pending().await.unwrap(), 0);
}
