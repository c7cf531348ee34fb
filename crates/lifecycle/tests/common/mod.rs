//! Lifecycle test utilities: in-memory storage and documents over a real
//! SQLite ledger.

use async_trait::async_trait;
use bytes::Bytes;
use folio_core::config::LifecycleConfig;
use folio_core::{MediaExtractor, VersionKind, VersionRef};
use folio_lifecycle::{DocumentStore, Lifecycle, LifecycleError, LifecycleResult};
use folio_metadata::{MetadataStore, SqliteStore};
use folio_storage::{
    ContinuationToken, ListingCapabilities, ListingOptions, ListingPage, ListingResume,
    ObjectMeta, ObjectStore, PageStream, StorageError, StorageResult,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

pub const CDN: &str = "https://cdn.example.com";

/// A failure to return from `delete` for one key.
#[derive(Clone, Copy, Debug)]
#[allow(dead_code)]
pub enum DeleteFailure {
    PermissionDenied,
    Timeout,
}

/// Object store held in memory, with resumable listings and injectable
/// delete failures.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    delete_failures: Mutex<HashMap<String, DeleteFailure>>,
    /// Fail every listing page after this many have been served.
    fail_listing_after: Mutex<Option<usize>>,
    deletes: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn insert(&self, key: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from_static(b"\x89PNG"));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn fail_delete(&self, key: &str, failure: DeleteFailure) {
        self.delete_failures
            .lock()
            .unwrap()
            .insert(key.to_string(), failure);
    }

    pub fn fail_listing_after(&self, pages: usize) {
        *self.fail_listing_after.lock().unwrap() = Some(pages);
    }

    /// Keys passed to `delete`, in call order.
    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            last_modified: None,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        if let Some(failure) = self.delete_failures.lock().unwrap().get(key) {
            return Err(match failure {
                DeleteFailure::PermissionDenied => {
                    StorageError::PermissionDenied(format!("{key}: access denied"))
                }
                DeleteFailure::Timeout => StorageError::Timeout(format!("{key}: deadline")),
            });
        }
        match self.objects.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn listing_capabilities(&self) -> ListingCapabilities {
        ListingCapabilities { resumable: true }
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a> {
        let page_size = options.normalized_page_size();
        let after = match resume.map(|r| r.start_token.cursor_for(prefix)).transpose() {
            Ok(after) => after,
            Err(e) => return Box::pin(futures::stream::iter(vec![Err(e)])),
        };

        let keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| after.as_ref().is_none_or(|a| k.as_str() > a.as_str()))
            .cloned()
            .collect();
        let fail_after = *self.fail_listing_after.lock().unwrap();

        let chunks: Vec<Vec<String>> = keys.chunks(page_size).map(<[String]>::to_vec).collect();
        let total = chunks.len();
        let mut pages = Vec::with_capacity(total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            if fail_after.is_some_and(|n| i >= n) {
                pages.push(Err(StorageError::Io(std::io::Error::other(
                    "connection reset",
                ))));
                break;
            }
            let next_token = match chunk.last() {
                Some(last) if i + 1 < total => {
                    match ContinuationToken::for_prefix(prefix, last) {
                        Ok(token) => Some(token),
                        Err(e) => {
                            pages.push(Err(e));
                            break;
                        }
                    }
                }
                _ => None,
            };
            pages.push(Ok(ListingPage {
                keys: chunk,
                next_token,
            }));
        }
        Box::pin(futures::stream::iter(pages))
    }
}

/// Draft and versions held in memory.
#[derive(Default)]
pub struct MemoryDocuments {
    draft: Mutex<Option<Value>>,
    versions: Mutex<BTreeMap<String, (VersionKind, Value)>>,
    unreadable: Mutex<Option<String>>,
}

#[allow(dead_code)]
impl MemoryDocuments {
    pub fn set_draft(&self, content: Value) {
        *self.draft.lock().unwrap() = Some(content);
    }

    pub fn put_version(&self, version_id: &str, kind: VersionKind, content: Value) {
        self.versions
            .lock()
            .unwrap()
            .insert(version_id.to_string(), (kind, content));
    }

    pub fn remove_version(&self, version_id: &str) {
        self.versions.lock().unwrap().remove(version_id);
    }

    /// Make `load_version` fail for one version.
    pub fn make_unreadable(&self, version_id: &str) {
        *self.unreadable.lock().unwrap() = Some(version_id.to_string());
    }
}

#[async_trait]
impl DocumentStore for MemoryDocuments {
    async fn load_draft(&self) -> LifecycleResult<Option<Value>> {
        Ok(self.draft.lock().unwrap().clone())
    }

    async fn list_versions(&self) -> LifecycleResult<Vec<VersionRef>> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (kind, _))| {
                VersionRef::new(id.clone(), *kind, format!("documents/versions/{kind}/{id}.json"))
            })
            .collect())
    }

    async fn load_version(&self, version: &VersionRef) -> LifecycleResult<Value> {
        if self.unreadable.lock().unwrap().as_deref() == Some(version.version_id.as_str()) {
            return Err(LifecycleError::Storage(StorageError::Timeout(
                version.storage_key.clone(),
            )));
        }
        self.versions
            .lock()
            .unwrap()
            .get(&version.version_id)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| StorageError::NotFound(version.storage_key.clone()).into())
    }
}

/// A lifecycle wired to in-memory storage and a temp-dir SQLite ledger.
pub struct TestLifecycle {
    pub lifecycle: Lifecycle,
    pub storage: Arc<MemoryStore>,
    pub documents: Arc<MemoryDocuments>,
    pub metadata: Arc<dyn MetadataStore>,
    sqlite: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestLifecycle {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: LifecycleConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("lifecycle.db"))
                .await
                .expect("Failed to open SQLite store"),
        );
        let metadata: Arc<dyn MetadataStore> = sqlite.clone();
        let storage = Arc::new(MemoryStore::default());
        let documents = Arc::new(MemoryDocuments::default());
        let lifecycle = Lifecycle::new(
            metadata.clone(),
            storage.clone(),
            documents.clone(),
            MediaExtractor::new(CDN, "ebooks/", ["src", "href", "srcset"]),
            config,
        );
        Self {
            lifecycle,
            storage,
            documents,
            metadata,
            sqlite,
            _temp_dir: temp_dir,
        }
    }

    /// Raw pool access for injecting ledger drift.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Sqlite> {
        self.sqlite.pool()
    }
}

pub fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        grace_period_secs: 900,
        batch_size: 100,
        max_attempts: 3,
        operation_timeout_secs: 10,
        ..LifecycleConfig::default()
    }
}

/// A fixed instant, so tests don't depend on wall-clock ordering.
#[allow(dead_code)]
pub fn t0() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_750_000_000).expect("valid timestamp")
}

#[allow(dead_code)]
pub fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}

/// Absolute CDN URL of a media key.
#[allow(dead_code)]
pub fn url(key: &str) -> String {
    format!("{CDN}/{key}")
}

/// A document with one image per key.
#[allow(dead_code)]
pub fn doc_with_images(keys: &[&str]) -> Value {
    let blocks: Vec<Value> = keys
        .iter()
        .map(|key| json!({"type": "image", "attrs": {"src": url(key)}}))
        .collect();
    json!({"type": "doc", "content": blocks})
}
