//! Reindex and incremental ledger maintenance.

mod common;

use common::{TestLifecycle, doc_with_images, minutes, t0, url};
use folio_core::{VersionKind, VersionRef};
use folio_lifecycle::LifecycleError;
use serde_json::json;

fn seed_documents(t: &TestLifecycle) {
    t.documents
        .set_draft(doc_with_images(&["ebooks/b1/a.png", "ebooks/b1/b.png"]));
    t.documents.put_version(
        "v1",
        VersionKind::Manual,
        json!({
            "type": "doc",
            "content": [
                {"type": "image", "attrs": {"src": url("ebooks/b1/a.png")}},
                {"type": "gallery", "items": [{"srcset": format!("{} 1x, {} 2x", url("ebooks/b1/c.png"), url("ebooks/b1/c@2x.png"))}]},
                {"type": "link", "attrs": {"href": "https://elsewhere.example.com/ebooks/b1/x.png"}}
            ]
        }),
    );
    t.documents.put_version(
        "v2",
        VersionKind::Published,
        doc_with_images(&["ebooks/b1/c.png", "other/not-managed.png"]),
    );
}

#[tokio::test]
async fn test_reindex_counts_every_source() {
    let t = TestLifecycle::new().await;
    seed_documents(&t);

    let report = t.lifecycle.reindex_now_at(t0()).await.unwrap();
    assert_eq!(report.keys_discovered, 4);
    assert_eq!(report.autosave_keys, 2);
    assert_eq!(report.versions_scanned, 2);
    assert_eq!(report.version_references, 4);
    assert_eq!(report.rows_reset, 0);

    let a = t.metadata.get_usage("ebooks/b1/a.png").await.unwrap().unwrap();
    assert!(a.in_autosave);
    assert_eq!((a.manual_refs, a.published_refs), (1, 0));

    let c = t.metadata.get_usage("ebooks/b1/c.png").await.unwrap().unwrap();
    assert!(!c.in_autosave);
    assert_eq!((c.manual_refs, c.published_refs), (1, 1));

    let c2 = t.metadata.get_usage("ebooks/b1/c@2x.png").await.unwrap().unwrap();
    assert_eq!(c2.manual_refs, 1);

    assert!(t.metadata.get_usage("other/not-managed.png").await.unwrap().is_none());
    assert_eq!(t.metadata.version_media("v1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_reindex_twice_yields_identical_ledger() {
    let t = TestLifecycle::new().await;
    seed_documents(&t);

    let now = t0();
    t.lifecycle.reindex_now_at(now).await.unwrap();
    let usage_first = t.metadata.list_usage().await.unwrap();
    let mapping_first = t.metadata.version_media("v1").await.unwrap();

    let second = t.lifecycle.reindex_now_at(now).await.unwrap();
    assert_eq!(second.rows_reset, 4);
    assert_eq!(second.mappings_pruned, 0);
    assert_eq!(t.metadata.list_usage().await.unwrap(), usage_first);
    assert_eq!(t.metadata.version_media("v1").await.unwrap(), mapping_first);
}

#[tokio::test]
async fn test_reindex_repairs_drift_without_deleting_rows() {
    let t = TestLifecycle::new().await;
    seed_documents(&t);
    let now = t0();

    // A version recorded incrementally that no longer exists in the store.
    let gone = VersionRef::new("v0", VersionKind::Published, "documents/versions/published/v0.json");
    t.lifecycle
        .record_version_at(&gone, &doc_with_images(&["ebooks/b1/old.png"]), now)
        .await
        .unwrap();

    let report = t.lifecycle.reindex_now_at(now + minutes(1)).await.unwrap();
    assert_eq!(report.mappings_pruned, 1);

    let old = t.metadata.get_usage("ebooks/b1/old.png").await.unwrap().unwrap();
    assert!(!old.is_referenced());
    assert!(t.metadata.version_media("v0").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reindex_aborts_without_changes_when_a_version_is_unreadable() {
    let t = TestLifecycle::new().await;
    seed_documents(&t);
    t.lifecycle.reindex_now_at(t0()).await.unwrap();
    let before = t.metadata.list_usage().await.unwrap();

    t.documents.set_draft(doc_with_images(&[]));
    t.documents.make_unreadable("v2");

    let err = t.lifecycle.reindex_now_at(t0() + minutes(5)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Storage(_)));
    assert_eq!(t.metadata.list_usage().await.unwrap(), before);
}

#[tokio::test]
async fn test_reindex_without_draft_clears_autosave_flags() {
    let t = TestLifecycle::new().await;
    t.lifecycle
        .sync_autosave_at(&doc_with_images(&["ebooks/b1/a.png"]), t0())
        .await
        .unwrap();

    let report = t.lifecycle.reindex_now_at(t0()).await.unwrap();
    assert_eq!(report.autosave_keys, 0);
    let a = t.metadata.get_usage("ebooks/b1/a.png").await.unwrap().unwrap();
    assert!(!a.in_autosave);
}

#[tokio::test]
async fn test_sync_autosave_reports_flagged_and_cleared() {
    let t = TestLifecycle::new().await;
    let lc = &t.lifecycle;

    let first = lc
        .sync_autosave_at(&doc_with_images(&["ebooks/b1/a.png", "ebooks/b1/b.png"]), t0())
        .await
        .unwrap();
    assert_eq!((first.flagged, first.cleared), (2, 0));

    let second = lc
        .sync_autosave_at(&doc_with_images(&["ebooks/b1/b.png"]), t0())
        .await
        .unwrap();
    assert_eq!((second.flagged, second.cleared), (1, 1));
}

#[tokio::test]
async fn test_rerecording_a_version_replaces_its_mapping() {
    let t = TestLifecycle::new().await;
    let lc = &t.lifecycle;
    let v1 = VersionRef::new("v1", VersionKind::Manual, "documents/versions/manual/v1.json");

    lc.record_version_at(&v1, &doc_with_images(&["ebooks/b1/a.png"]), t0())
        .await
        .unwrap();
    let update = lc
        .record_version_at(&v1, &doc_with_images(&["ebooks/b1/b.png"]), t0())
        .await
        .unwrap();
    assert_eq!(update.media_keys, 1);
    assert_eq!(update.released, 1);

    let a = t.metadata.get_usage("ebooks/b1/a.png").await.unwrap().unwrap();
    let b = t.metadata.get_usage("ebooks/b1/b.png").await.unwrap().unwrap();
    assert_eq!((a.manual_refs, b.manual_refs), (0, 1));
}

#[tokio::test]
async fn test_release_on_zero_counter_clamps_and_reports() {
    let t = TestLifecycle::new().await;
    let lc = &t.lifecycle;
    let v1 = VersionRef::new("v1", VersionKind::Manual, "documents/versions/manual/v1.json");
    lc.record_version_at(&v1, &doc_with_images(&["ebooks/b1/a.png"]), t0())
        .await
        .unwrap();

    sqlx::query("UPDATE media_usage SET manual_refs = 0 WHERE media_key = 'ebooks/b1/a.png'")
        .execute(t.pool())
        .await
        .unwrap();

    let update = lc.release_version("v1").await.unwrap();
    assert_eq!(update.released, 0);
    assert_eq!(update.clamped, vec!["ebooks/b1/a.png".to_string()]);

    let a = t.metadata.get_usage("ebooks/b1/a.png").await.unwrap().unwrap();
    assert_eq!(a.manual_refs, 0);
}
