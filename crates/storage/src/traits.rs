//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed stream of listing pages.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>>;

/// Page size constraints for listing operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Maximum size for continuation tokens (2 KB).
pub const MAX_TOKEN_SIZE: usize = 2048;

/// An opaque continuation token for resuming listing operations.
///
/// Tokens are bound to the prefix they were issued for; resuming a listing
/// under a different prefix is rejected.
#[derive(Clone, PartialEq, Eq)]
pub struct ContinuationToken(Vec<u8>);

#[derive(Serialize, Deserialize)]
struct TokenEnvelope {
    prefix: String,
    cursor: String,
}

impl ContinuationToken {
    /// Create a new continuation token from raw bytes.
    ///
    /// Returns an error if the token exceeds MAX_TOKEN_SIZE.
    pub fn new(data: Vec<u8>) -> StorageResult<Self> {
        if data.len() > MAX_TOKEN_SIZE {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token too large: {} bytes (max: {})",
                data.len(),
                MAX_TOKEN_SIZE
            )));
        }
        Ok(Self(data))
    }

    /// Wrap a backend cursor together with the prefix it belongs to.
    pub fn for_prefix(prefix: &str, cursor: &str) -> StorageResult<Self> {
        let envelope = TokenEnvelope {
            prefix: prefix.to_string(),
            cursor: cursor.to_string(),
        };
        let data = serde_json::to_vec(&envelope)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Self::new(data)
    }

    /// Unwrap the backend cursor, checking it was issued for `prefix`.
    pub fn cursor_for(&self, prefix: &str) -> StorageResult<String> {
        let envelope: TokenEnvelope = serde_json::from_slice(&self.0).map_err(|e| {
            StorageError::InvalidContinuationToken(format!("malformed token: {e}"))
        })?;
        if envelope.prefix != prefix {
            return Err(StorageError::InvalidContinuationToken(format!(
                "token was issued for prefix '{}', not '{}'",
                envelope.prefix, prefix
            )));
        }
        Ok(envelope.cursor)
    }

    /// Convert to base64 for serialization.
    pub fn to_base64(&self) -> String {
        use base64::{Engine as _, engine::general_purpose};
        general_purpose::URL_SAFE_NO_PAD.encode(&self.0)
    }

    /// Parse from base64.
    pub fn from_base64(s: &str) -> StorageResult<Self> {
        // Reject before decoding; 4/3 expansion fits comfortably in 2x.
        const MAX_BASE64_INPUT: usize = MAX_TOKEN_SIZE * 2;
        if s.len() > MAX_BASE64_INPUT {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token base64 too large: {} bytes (max: {})",
                s.len(),
                MAX_BASE64_INPUT
            )));
        }

        use base64::{Engine as _, engine::general_purpose};
        let data = general_purpose::URL_SAFE_NO_PAD.decode(s).map_err(|e| {
            StorageError::InvalidContinuationToken(format!(
                "invalid continuation token base64: {e}"
            ))
        })?;
        Self::new(data)
    }
}

impl std::fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContinuationToken")
            .field(&"<redacted>")
            .finish()
    }
}

/// A single page of listing results.
#[derive(Clone, Debug)]
pub struct ListingPage {
    /// Object keys in this page.
    pub keys: Vec<String>,

    /// Continuation token for the next page. None on the last page.
    pub next_token: Option<ContinuationToken>,
}

/// Backend capabilities for listing operations.
#[derive(Clone, Debug)]
pub struct ListingCapabilities {
    /// Whether a listing can be resumed from a continuation token.
    pub resumable: bool,
}

/// Options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingOptions {
    /// Number of keys to fetch per page, clamped to [MIN_PAGE_SIZE, MAX_PAGE_SIZE].
    pub page_size: usize,
}

impl ListingOptions {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    /// Get the normalized page size.
    pub fn normalized_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Resume options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingResume {
    pub start_token: ContinuationToken,
}

impl ListingResume {
    pub fn new(start_token: ContinuationToken) -> Self {
        Self { start_token }
    }
}

/// Object store holding managed media and document snapshots.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object.
    ///
    /// Returns `StorageError::NotFound` when the object is already absent.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Static identifier for the backend type, used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Get the listing capabilities of this backend.
    fn listing_capabilities(&self) -> ListingCapabilities;

    /// List objects under `prefix` as a stream of pages.
    ///
    /// Each page holds at most `options.normalized_page_size()` keys. Backends
    /// that cannot resume return `StorageError::ListingNotResumable` when a
    /// `resume` token is supplied.
    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a>;

    /// Verify storage backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Flat key stream over `list_pages()`.
///
/// Implemented for every ObjectStore via the blanket impl below.
pub trait ObjectStoreListStreamExt: ObjectStore {
    fn list_stream_ext<'a>(
        &'a self,
        prefix: &str,
        options: Option<ListingOptions>,
    ) -> Pin<Box<dyn Stream<Item = StorageResult<String>> + Send + 'a>> {
        let options = options.unwrap_or_default();
        let page_stream = self.list_pages(prefix, options, None);

        let key_stream = page_stream.flat_map(|page_result| match page_result {
            Ok(page) => futures::stream::iter(page.keys.into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        });

        Box::pin(key_stream)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreListStreamExt for T {}

/// JSON document helpers on top of `get`/`put`.
#[async_trait]
pub trait ObjectStoreJsonExt: ObjectStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> StorageResult<T> {
        let data = self.get(key).await?;
        serde_json::from_slice(&data)
            .map_err(|e| StorageError::Serialization(format!("{key}: {e}")))
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> StorageResult<()> {
        let data = serde_json::to_vec(value)
            .map_err(|e| StorageError::Serialization(format!("{key}: {e}")))?;
        self.put(key, Bytes::from(data)).await
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreJsonExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_token_from_base64_rejects_oversized_input() {
        let huge_base64 = "A".repeat(5000);

        let err = ContinuationToken::from_base64(&huge_base64).unwrap_err();
        assert!(err.to_string().contains("base64 too large"));
    }

    #[test]
    fn test_continuation_token_new_rejects_oversized_payload() {
        let result = ContinuationToken::new(vec![0u8; MAX_TOKEN_SIZE + 1]);
        assert!(matches!(
            result,
            Err(StorageError::InvalidContinuationToken(_))
        ));
    }

    #[test]
    fn test_continuation_token_is_bound_to_prefix() {
        let token = ContinuationToken::for_prefix("ebooks/", "cursor-42").unwrap();
        let parsed = ContinuationToken::from_base64(&token.to_base64()).unwrap();

        assert_eq!(parsed.cursor_for("ebooks/").unwrap(), "cursor-42");
        assert!(matches!(
            parsed.cursor_for("documents/"),
            Err(StorageError::InvalidContinuationToken(_))
        ));
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        let token = ContinuationToken::new(b"not json".to_vec()).unwrap();
        assert!(token.cursor_for("ebooks/").is_err());
        assert!(ContinuationToken::from_base64("***").is_err());
    }

    #[test]
    fn test_listing_options_clamp() {
        assert_eq!(ListingOptions::new(0).normalized_page_size(), 1);
        assert_eq!(ListingOptions::new(50).normalized_page_size(), 50);
        assert_eq!(ListingOptions::new(5000).normalized_page_size(), 1000);
    }
}
