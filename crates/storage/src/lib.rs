//! Object storage abstraction and backends for managed media.
//!
//! Media binaries and document snapshots both live behind [`ObjectStore`].
//! Backends: local filesystem and S3-compatible.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{
    filesystem::FilesystemBackend,
    s3::{S3Backend, S3Settings},
};
pub use error::{StorageError, StorageResult};
pub use traits::{
    ContinuationToken, ListingCapabilities, ListingOptions, ListingPage, ListingResume,
    ObjectMeta, ObjectStore, ObjectStoreJsonExt, ObjectStoreListStreamExt, PageStream,
};

use folio_core::config::StorageConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create an object store from configuration.
///
/// `operation_timeout` bounds each remote call on backends that support it.
pub async fn from_config(
    config: &StorageConfig,
    operation_timeout: Duration,
) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(S3Settings {
                bucket: bucket.clone(),
                endpoint: endpoint.clone(),
                region: region.clone(),
                prefix: prefix.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: *force_path_style,
                operation_timeout: Some(operation_timeout),
            })
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("media"),
        };

        let store = from_config(&config, TIMEOUT).await.unwrap();
        assert_eq!(store.backend_name(), "filesystem");
        store
            .put("ebooks/cover.png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        assert!(store.exists("ebooks/cover.png").await.unwrap());
    }

    #[tokio::test]
    async fn from_config_s3_ok() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("folio".to_string()),
            access_key_id: Some("access".to_string()),
            secret_access_key: Some("secret".to_string()),
            force_path_style: true,
        };

        let store = from_config(&config, TIMEOUT).await.unwrap();
        assert_eq!(store.backend_name(), "s3");
        assert!(store.listing_capabilities().resumable);
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config, TIMEOUT).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_helpers_roundtrip_through_store() {
        let temp = tempdir().unwrap();
        let store = FilesystemBackend::new(temp.path()).await.unwrap();

        let doc = serde_json::json!({"blocks": [{"src": "https://cdn/x.png"}]});
        store.put_json("documents/draft.json", &doc).await.unwrap();
        let loaded: serde_json::Value = store.get_json("documents/draft.json").await.unwrap();
        assert_eq!(loaded, doc);

        store
            .put("documents/broken.json", Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        let result: StorageResult<serde_json::Value> =
            store.get_json("documents/broken.json").await;
        let err = result.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
