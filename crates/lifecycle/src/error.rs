//! Lifecycle error types and per-key failure classification.

use folio_metadata::MetadataError;
use folio_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Errors surfaced by lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{component} unavailable: {reason}")]
    Unavailable {
        component: &'static str,
        reason: String,
    },

    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("document error: {0}")]
    Document(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] folio_core::Error),
}

impl LifecycleError {
    /// Stable code for logs and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Unavailable { .. } => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Document(_) => "document_error",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "invalid_request",
        }
    }

    /// Whether this error means the infrastructure is unusable for the run,
    /// as opposed to a rejected request.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Metadata(e) => e.is_connection_error() || matches!(e, MetadataError::Config(_)),
            Self::Storage(e) => !matches!(
                e,
                StorageError::NotFound(_)
                    | StorageError::InvalidKey(_)
                    | StorageError::InvalidContinuationToken(_)
                    | StorageError::ListingNotResumable
            ),
            Self::Document(_) | Self::Core(_) => false,
        }
    }
}

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Why a single key's deletion attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PermissionDenied,
    Timeout,
    NotFound,
    Other,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Other => "other",
        }
    }

    pub fn classify(err: &LifecycleError) -> Self {
        match err {
            LifecycleError::Timeout { .. } => Self::Timeout,
            LifecycleError::Storage(e) => match e {
                StorageError::NotFound(_) => Self::NotFound,
                StorageError::PermissionDenied(_) => Self::PermissionDenied,
                StorageError::Timeout(_) => Self::Timeout,
                StorageError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => Self::Timeout,
                _ => Self::Other,
            },
            _ => Self::Other,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Await `future`, failing with [`LifecycleError::Timeout`] once `timeout` elapses.
pub async fn with_timeout<F, T, E>(
    operation: &'static str,
    timeout: Duration,
    future: F,
) -> LifecycleResult<T>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<LifecycleError>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(LifecycleError::Timeout { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_storage_errors() {
        let cases = [
            (StorageError::NotFound("k".into()), FailureReason::NotFound),
            (
                StorageError::PermissionDenied("k".into()),
                FailureReason::PermissionDenied,
            ),
            (StorageError::Timeout("k".into()), FailureReason::Timeout),
            (
                StorageError::Io(std::io::ErrorKind::TimedOut.into()),
                FailureReason::Timeout,
            ),
            (StorageError::Config("bad".into()), FailureReason::Other),
        ];
        for (err, expected) in cases {
            assert_eq!(FailureReason::classify(&err.into()), expected);
        }

        let timeout = LifecycleError::Timeout {
            operation: "delete object",
            timeout: Duration::from_secs(30),
        };
        assert_eq!(FailureReason::classify(&timeout), FailureReason::Timeout);
        assert_eq!(
            FailureReason::classify(&LifecycleError::Document("x".into())),
            FailureReason::Other
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(LifecycleError::Config("x".into()).is_fatal());
        assert!(
            LifecycleError::Unavailable {
                component: "storage",
                reason: "refused".into()
            }
            .is_fatal()
        );
        assert!(!LifecycleError::Core(folio_core::Error::InvalidMediaKey("/x".into())).is_fatal());
        assert!(!LifecycleError::Storage(StorageError::ListingNotResumable).is_fatal());
        assert!(LifecycleError::Storage(StorageError::PermissionDenied("b".into())).is_fatal());
    }

    #[test]
    fn test_failure_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::PermissionDenied).unwrap();
        assert_eq!(json, "\"permission_denied\"");
        assert_eq!(FailureReason::NotFound.to_string(), "not_found");
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let result: LifecycleResult<()> = with_timeout(
            "slow call",
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StorageError>(())
            },
        )
        .await;
        match result {
            Err(LifecycleError::Timeout { operation, .. }) => assert_eq!(operation, "slow call"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_maps_inner_error() {
        let result: LifecycleResult<()> = with_timeout("lookup", Duration::from_secs(1), async {
            Err(StorageError::NotFound("ebooks/a.png".into()))
        })
        .await;
        assert!(matches!(
            result,
            Err(LifecycleError::Storage(StorageError::NotFound(_)))
        ));
    }
}
