//! Metadata store test utilities.

pub mod scenarios;

use folio_metadata::{MetadataResult, MetadataStore, PostgresStore, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

/// Env var naming a disposable PostgreSQL database for integration tests.
pub const POSTGRES_URL_ENV: &str = "FOLIO_TEST_POSTGRES_URL";

/// A test metadata store wrapper that cleans up on drop.
pub struct TestMetadata {
    store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a SQLite store in a fresh temp directory.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = SqliteStore::new(temp_dir.path().join("lifecycle.db")).await?;
        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Raw pool access for injecting drift that the API cannot produce.
    #[allow(dead_code)]
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Sqlite> {
        self.store.pool()
    }
}

/// Connect to the PostgreSQL database named by [`POSTGRES_URL_ENV`], wiping
/// lifecycle tables first. Returns `None` when the variable is unset.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<Arc<dyn MetadataStore>> {
    let Ok(url) = std::env::var(POSTGRES_URL_ENV) else {
        eprintln!("Skipping PostgreSQL test ({POSTGRES_URL_ENV} not set)");
        return None;
    };
    let store = PostgresStore::from_url(&url, 2, Some(30_000))
        .await
        .expect("PostgreSQL test setup failed");
    sqlx::query(
        "TRUNCATE media_usage, media_pending_deletions, version_media, media_dead_letters",
    )
    .execute(store.pool())
    .await
    .expect("Failed to truncate lifecycle tables");
    Some(Arc::new(store))
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

pub fn keys(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
