//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix prepended to every media key.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the default credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the default credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/media"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage requires a path".to_string());
                }
                Ok(())
            }
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer FOLIO_METADATA__PASSWORD over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    5
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/lifecycle.db"),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// How managed assets are recognised inside document content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Absolute URL prefix under which managed assets are served.
    pub cdn_base_url: String,
    /// Key prefix a derived key must start with to be managed.
    pub allowed_prefix: String,
    /// Field names whose values are always inspected as media references.
    #[serde(default = "default_media_fields")]
    pub media_fields: Vec<String>,
}

fn default_media_fields() -> Vec<String> {
    ["src", "href", "poster", "srcset", "url", "data-src"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cdn_base_url: "https://cdn.example.com".to_string(),
            allowed_prefix: "ebooks/".to_string(),
            media_fields: default_media_fields(),
        }
    }
}

impl MediaConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cdn_base_url.trim().is_empty() {
            return Err("media.cdn_base_url must not be empty".to_string());
        }
        if self.allowed_prefix.trim().is_empty() {
            return Err("media.allowed_prefix must not be empty".to_string());
        }
        if self.allowed_prefix.starts_with('/') {
            return Err("media.allowed_prefix must be relative (no leading '/')".to_string());
        }
        Ok(())
    }
}

/// Where the live draft and version snapshots live in blob storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default = "default_draft_key")]
    pub draft_key: String,
    #[serde(default = "default_versions_prefix")]
    pub versions_prefix: String,
}

fn default_draft_key() -> String {
    "documents/draft.json".to_string()
}

fn default_versions_prefix() -> String {
    "documents/versions/".to_string()
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            draft_key: default_draft_key(),
            versions_prefix: default_versions_prefix(),
        }
    }
}

/// Lower bound for per-call timeouts.
pub const MIN_OPERATION_TIMEOUT_SECS: u64 = 10;
/// Upper bound for per-call timeouts.
pub const MAX_OPERATION_TIMEOUT_SECS: u64 = 60;
/// Upper bound for a single GC batch.
pub const MAX_BATCH_SIZE: u32 = 1000;

/// Lifecycle job configuration: grace period, GC batching and audit bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Delay between enqueueing a key and allowing its physical deletion.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Maximum due candidates processed per GC run.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Failed deletions beyond this count move to the dead-letter table.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Timeout applied to every metadata and storage call.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Usage rows not seen for this many days are probed by the audit.
    #[serde(default = "default_audit_stale_after_days")]
    pub audit_stale_after_days: u32,
    /// Maximum stale usage rows probed per audit.
    #[serde(default = "default_audit_sample_size")]
    pub audit_sample_size: u32,
    /// Page size requested from storage listings.
    #[serde(default = "default_audit_page_size")]
    pub audit_page_size: usize,
    /// Objects listed per audit before returning a resume token.
    #[serde(default = "default_audit_max_objects")]
    pub audit_max_objects: u64,
    /// Cap on orphan/missing keys included in a report.
    #[serde(default = "default_audit_max_reported")]
    pub audit_max_reported: usize,
    /// Report what GC would delete without touching storage or the queue.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_grace_period_secs() -> u64 {
    900 // 15 minutes
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_attempts() -> u32 {
    10
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_audit_stale_after_days() -> u32 {
    90
}

fn default_audit_sample_size() -> u32 {
    200
}

fn default_audit_page_size() -> usize {
    1000
}

fn default_audit_max_objects() -> u64 {
    100_000
}

fn default_audit_max_reported() -> usize {
    1000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            operation_timeout_secs: default_operation_timeout_secs(),
            audit_stale_after_days: default_audit_stale_after_days(),
            audit_sample_size: default_audit_sample_size(),
            audit_page_size: default_audit_page_size(),
            audit_max_objects: default_audit_max_objects(),
            audit_max_reported: default_audit_max_reported(),
            dry_run: false,
        }
    }
}

impl LifecycleConfig {
    /// Get the grace period as a Duration.
    pub fn grace_period(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Batch size clamped to `1..=MAX_BATCH_SIZE`.
    pub fn effective_batch_size(&self) -> u32 {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    pub fn operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn audit_stale_after(&self) -> Duration {
        Duration::days(i64::from(self.audit_stale_after_days))
    }

    /// Validate lifecycle settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.grace_period_secs > i64::MAX as u64 {
            return Err(format!(
                "lifecycle.grace_period_secs {} exceeds maximum value {}",
                self.grace_period_secs,
                i64::MAX
            ));
        }
        if !(MIN_OPERATION_TIMEOUT_SECS..=MAX_OPERATION_TIMEOUT_SECS)
            .contains(&self.operation_timeout_secs)
        {
            return Err(format!(
                "lifecycle.operation_timeout_secs must be between {} and {} (got {})",
                MIN_OPERATION_TIMEOUT_SECS, MAX_OPERATION_TIMEOUT_SECS, self.operation_timeout_secs
            ));
        }
        if self.max_attempts == 0 {
            return Err("lifecycle.max_attempts must be at least 1".to_string());
        }
        if self.audit_page_size == 0 {
            return Err("lifecycle.audit_page_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl AppConfig {
    /// Validate every section, returning the first failure.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.media.validate()?;
        self.lifecycle.validate()?;
        Ok(())
    }
}
