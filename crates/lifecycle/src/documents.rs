//! Read access to the live draft and stored version snapshots.

use crate::error::{LifecycleError, LifecycleResult};
use async_trait::async_trait;
use folio_core::config::DocumentsConfig;
use folio_core::{VersionKind, VersionRef};
use folio_storage::{ObjectStore, ObjectStoreJsonExt, ObjectStoreListStreamExt, StorageError};
use futures::TryStreamExt;
use serde_json::Value;
use std::sync::Arc;

/// Source of document content for reindexing.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current live draft, or `None` when no draft has been saved yet.
    async fn load_draft(&self) -> LifecycleResult<Option<Value>>;

    /// Every stored version snapshot.
    async fn list_versions(&self) -> LifecycleResult<Vec<VersionRef>>;

    /// Content of one version snapshot.
    async fn load_version(&self, version: &VersionRef) -> LifecycleResult<Value>;
}

/// Documents kept as JSON objects in blob storage.
///
/// Layout: the draft at `draft_key`, snapshots at
/// `<versions_prefix><kind>/<version_id>.json`.
pub struct BlobDocumentStore {
    storage: Arc<dyn ObjectStore>,
    config: DocumentsConfig,
}

impl BlobDocumentStore {
    pub fn new(storage: Arc<dyn ObjectStore>, config: DocumentsConfig) -> Self {
        Self { storage, config }
    }

    /// Storage key of a snapshot.
    pub fn version_key(&self, kind: VersionKind, version_id: &str) -> String {
        format!("{}{}/{}.json", self.versions_prefix(), kind, version_id)
    }

    fn versions_prefix(&self) -> String {
        let prefix = self.config.versions_prefix.trim_end_matches('/');
        format!("{prefix}/")
    }

    /// Parse a listed key back into a version reference.
    fn parse_version_key(&self, key: &str) -> Option<VersionRef> {
        let rest = key.strip_prefix(&self.versions_prefix())?;
        let (kind, file) = rest.split_once('/')?;
        let version_id = file.strip_suffix(".json")?;
        if version_id.is_empty() || version_id.contains('/') {
            return None;
        }
        let kind: VersionKind = kind.parse().ok()?;
        Some(VersionRef::new(version_id, kind, key))
    }
}

#[async_trait]
impl DocumentStore for BlobDocumentStore {
    async fn load_draft(&self) -> LifecycleResult<Option<Value>> {
        match self.storage.get_json(&self.config.draft_key).await {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(StorageError::Serialization(e)) => Err(LifecycleError::Document(format!(
                "draft is not valid JSON: {e}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_versions(&self) -> LifecycleResult<Vec<VersionRef>> {
        let keys: Vec<String> = self
            .storage
            .list_stream_ext(&self.versions_prefix(), None)
            .try_collect()
            .await?;

        let mut versions = Vec::with_capacity(keys.len());
        for key in keys {
            match self.parse_version_key(&key) {
                Some(version) => versions.push(version),
                None => {
                    tracing::debug!(key = %key, "Ignoring unrecognised object under versions prefix")
                }
            }
        }
        versions.sort_by(|a, b| a.version_id.cmp(&b.version_id));
        Ok(versions)
    }

    async fn load_version(&self, version: &VersionRef) -> LifecycleResult<Value> {
        let result: Result<Value, StorageError> =
            self.storage.get_json(&version.storage_key).await;
        result.map_err(|e| match e {
            StorageError::Serialization(msg) => LifecycleError::Document(format!(
                "version {} is not valid JSON: {msg}",
                version.version_id
            )),
            other => other.into(),
        })
    }
}
