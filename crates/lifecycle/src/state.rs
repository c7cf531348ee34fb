//! Shared dependencies for lifecycle operations.

use crate::documents::{BlobDocumentStore, DocumentStore};
use crate::error::{LifecycleError, LifecycleResult, with_timeout};
use folio_core::MediaExtractor;
use folio_core::config::{AppConfig, LifecycleConfig};
use folio_metadata::MetadataStore;
use folio_storage::ObjectStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Everything an operation needs: the ledger, blob storage, the document
/// source and the extractor configured for the managed prefix.
///
/// Holds no in-process state between calls; all durable state lives in the
/// metadata store, so any number of instances may run side by side.
#[derive(Clone)]
pub struct Lifecycle {
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) storage: Arc<dyn ObjectStore>,
    pub(crate) documents: Arc<dyn DocumentStore>,
    pub(crate) extractor: Arc<MediaExtractor>,
    pub(crate) config: LifecycleConfig,
}

/// Result of probing both backends.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub metadata_backend: &'static str,
    pub storage_backend: &'static str,
    pub pending_deletions: u64,
}

impl Lifecycle {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        documents: Arc<dyn DocumentStore>,
        extractor: MediaExtractor,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            documents,
            extractor: Arc::new(extractor),
            config,
        }
    }

    /// Validate configuration, connect both backends and verify they answer.
    ///
    /// Any failure here is fatal for the run.
    pub async fn from_config(config: &AppConfig) -> LifecycleResult<Self> {
        config.validate().map_err(LifecycleError::Config)?;
        let timeout = config.lifecycle.operation_timeout();

        let storage = with_timeout(
            "storage connect",
            timeout,
            folio_storage::from_config(&config.storage, timeout),
        )
        .await
        .map_err(|e| unavailable("storage", e))?;
        tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

        let metadata = with_timeout(
            "metadata connect",
            timeout,
            folio_metadata::from_config(&config.metadata),
        )
        .await
        .map_err(|e| unavailable("metadata", e))?;
        tracing::info!(backend = metadata.backend_name(), "Metadata store initialized");

        let documents: Arc<dyn DocumentStore> = Arc::new(BlobDocumentStore::new(
            storage.clone(),
            config.documents.clone(),
        ));

        let lifecycle = Self::new(
            metadata,
            storage,
            documents,
            MediaExtractor::from_config(&config.media),
            config.lifecycle.clone(),
        );
        lifecycle.health_check().await?;
        Ok(lifecycle)
    }

    /// Probe metadata and storage; failures map to [`LifecycleError::Unavailable`].
    pub async fn health_check(&self) -> LifecycleResult<HealthReport> {
        let timeout = self.timeout();

        with_timeout("metadata health check", timeout, self.metadata.health_check())
            .await
            .map_err(|e| unavailable("metadata", e))?;
        with_timeout("storage health check", timeout, self.storage.health_check())
            .await
            .map_err(|e| unavailable("storage", e))?;
        let pending_deletions =
            with_timeout("count pending", timeout, self.metadata.count_pending())
                .await
                .map_err(|e| unavailable("metadata", e))?;

        Ok(HealthReport {
            metadata_backend: self.metadata.backend_name(),
            storage_backend: self.storage.backend_name(),
            pending_deletions,
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn extractor(&self) -> &MediaExtractor {
        &self.extractor
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStore> {
        &self.storage
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.config.operation_timeout()
    }
}

fn unavailable(component: &'static str, err: LifecycleError) -> LifecycleError {
    match err {
        LifecycleError::Config(_) => err,
        LifecycleError::Storage(folio_storage::StorageError::Config(msg)) => {
            LifecycleError::Config(msg)
        }
        LifecycleError::Metadata(folio_metadata::MetadataError::Config(msg)) => {
            LifecycleError::Config(msg)
        }
        other => LifecycleError::Unavailable {
            component,
            reason: other.to_string(),
        },
    }
}
