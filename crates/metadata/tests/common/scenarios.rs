//! Store-agnostic scenarios shared by the SQLite and PostgreSQL suites.

use super::{keys, minutes, t0};
use folio_core::VersionKind;
use folio_metadata::MetadataStore;
use std::sync::Arc;

pub async fn record_and_release_version(store: Arc<dyn MetadataStore>) {
    let now = t0();
    store
        .record_version("v1", VersionKind::Manual, &keys(&["ebooks/a.png", "ebooks/b.png"]), now)
        .await
        .unwrap();
    store
        .record_version("v2", VersionKind::Published, &keys(&["ebooks/a.png"]), now)
        .await
        .unwrap();

    let a = store.get_usage("ebooks/a.png").await.unwrap().unwrap();
    assert_eq!((a.manual_refs, a.published_refs), (1, 1));
    assert!(!a.in_autosave);

    let released = store.release_version("v1").await.unwrap();
    assert_eq!(released.decremented, 2);
    assert!(released.clamped.is_empty());
    assert!(store.version_media("v1").await.unwrap().is_empty());

    let a = store.get_usage("ebooks/a.png").await.unwrap().unwrap();
    assert_eq!((a.manual_refs, a.published_refs), (0, 1));
    let b = store.get_usage("ebooks/b.png").await.unwrap().unwrap();
    assert!(!b.is_referenced());
}

pub async fn rerecording_does_not_double_count(store: Arc<dyn MetadataStore>) {
    let now = t0();
    for _ in 0..3 {
        store
            .record_version("v1", VersionKind::Manual, &keys(&["ebooks/a.png"]), now)
            .await
            .unwrap();
    }
    let a = store.get_usage("ebooks/a.png").await.unwrap().unwrap();
    assert_eq!(a.manual_refs, 1);
}

pub async fn pending_queue_orders_and_bounds(store: Arc<dyn MetadataStore>) {
    let now = t0();
    for (i, key) in ["ebooks/c.png", "ebooks/a.png", "ebooks/b.png"].iter().enumerate() {
        store
            .upsert_pending(key, now, now + minutes(15 + i as i64))
            .await
            .unwrap();
    }
    assert!(store.due_pending(now, 10).await.unwrap().is_empty());

    let due = store.due_pending(now + minutes(30), 2).await.unwrap();
    let due_keys: Vec<&str> = due.iter().map(|r| r.media_key.as_str()).collect();
    assert_eq!(due_keys, vec!["ebooks/c.png", "ebooks/a.png"]);
    assert_eq!(store.count_pending().await.unwrap(), 3);
}

pub async fn complete_deletion_respects_rereference(store: Arc<dyn MetadataStore>) {
    let now = t0();
    store.sync_autosave(&keys(&["ebooks/a.png", "ebooks/b.png"]), now).await.unwrap();
    store.sync_autosave(&keys(&["ebooks/b.png"]), now).await.unwrap();
    store.upsert_pending("ebooks/a.png", now, now).await.unwrap();
    store.upsert_pending("ebooks/b.png", now, now).await.unwrap();

    let a = store.complete_deletion("ebooks/a.png").await.unwrap();
    assert!(a.pending_removed && a.usage_removed && !a.rereferenced);
    assert!(store.get_usage("ebooks/a.png").await.unwrap().is_none());

    let b = store.complete_deletion("ebooks/b.png").await.unwrap();
    assert!(b.pending_removed && !b.usage_removed && b.rereferenced);
    assert!(store.get_usage("ebooks/b.png").await.unwrap().is_some());
}

pub async fn dead_letter_and_requeue(store: Arc<dyn MetadataStore>) {
    let now = t0();
    store.upsert_pending("ebooks/a.png", now, now).await.unwrap();
    store
        .reschedule_pending("ebooks/a.png", now, now + minutes(15), "permission_denied")
        .await
        .unwrap();
    let pending = store.get_pending("ebooks/a.png").await.unwrap().unwrap();
    assert_eq!(pending.attempts, 1);
    assert_eq!(pending.last_error.as_deref(), Some("permission_denied"));

    assert!(store.dead_letter("ebooks/a.png", 2, "permission_denied", now).await.unwrap());
    assert!(store.get_pending("ebooks/a.png").await.unwrap().is_none());
    let letters = store.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 2);

    assert!(store
        .requeue_dead_letter("ebooks/a.png", now, now + minutes(15))
        .await
        .unwrap());
    assert!(store.list_dead_letters(10).await.unwrap().is_empty());
    let pending = store.get_pending("ebooks/a.png").await.unwrap().unwrap();
    assert_eq!(pending.attempts, 0);
    assert!(!store
        .requeue_dead_letter("ebooks/a.png", now, now)
        .await
        .unwrap());
}
