//! Metadata store trait and the SQLite implementation.

use crate::error::MetadataResult;
use crate::repos::{DeadLetterRepo, PendingDeletionRepo, UsageRepo, VersionMediaRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UsageRepo + VersionMediaRepo + PendingDeletionRepo + DeadLetterRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite database and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits a single writer; one connection serialises job instances
            // sharing this process.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::usage::counter_column;
    use crate::repos::{
        AutosaveSync, DecrementOutcome, RebuildStats, ReclaimOutcome, UsageSnapshot,
    };
    use folio_core::VersionKind;
    use sqlx::SqliteConnection;
    use std::collections::{BTreeSet, HashSet};
    use time::OffsetDateTime;

    /// SQLite caps bound parameters at 999; stay under it for IN clauses.
    const BATCH_SIZE: usize = 900;

    async fn increment_refs(
        conn: &mut SqliteConnection,
        media_key: &str,
        kind: VersionKind,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        let column = counter_column(kind);
        let sql = format!(
            "INSERT INTO media_usage (media_key, in_autosave, {column}, last_seen_at) \
             VALUES (?, 0, 1, ?) \
             ON CONFLICT(media_key) DO UPDATE SET {column} = {column} + 1, \
             last_seen_at = excluded.last_seen_at"
        );
        sqlx::query(&sql)
            .bind(media_key)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Decrement one counter, refusing to go below zero.
    ///
    /// Returns false when the row was missing or already zero (a clamp).
    async fn decrement_refs(
        conn: &mut SqliteConnection,
        media_key: &str,
        kind: VersionKind,
    ) -> MetadataResult<bool> {
        let column = counter_column(kind);
        let sql = format!(
            "UPDATE media_usage SET {column} = {column} - 1 WHERE media_key = ? AND {column} > 0"
        );
        let result = sqlx::query(&sql)
            .bind(media_key)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_mapping(
        conn: &mut SqliteConnection,
        version_id: &str,
    ) -> MetadataResult<DecrementOutcome> {
        let rows = sqlx::query_as::<_, VersionMediaRow>(
            "SELECT version_id, media_key, version_kind FROM version_media WHERE version_id = ?",
        )
        .bind(version_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut outcome = DecrementOutcome::default();
        for row in rows {
            let Some(kind) = row.kind() else {
                tracing::warn!(
                    version_id = %row.version_id,
                    version_kind = %row.version_kind,
                    "Mapping row has unknown version kind, skipping decrement"
                );
                outcome.clamped.push(row.media_key);
                continue;
            };
            if decrement_refs(conn, &row.media_key, kind).await? {
                outcome.decremented += 1;
            } else {
                outcome.clamped.push(row.media_key);
            }
        }

        sqlx::query("DELETE FROM version_media WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *conn)
            .await?;

        Ok(outcome)
    }

    async fn write_mapping(
        conn: &mut SqliteConnection,
        version_id: &str,
        kind: VersionKind,
        media_keys: &BTreeSet<&str>,
        now: OffsetDateTime,
    ) -> MetadataResult<u64> {
        for &media_key in media_keys {
            sqlx::query(
                "INSERT INTO version_media (version_id, media_key, version_kind) VALUES (?, ?, ?)",
            )
            .bind(version_id)
            .bind(media_key)
            .bind(kind.as_str())
            .execute(&mut *conn)
            .await?;
            increment_refs(conn, media_key, kind, now).await?;
        }
        Ok(media_keys.len() as u64)
    }

    async fn flag_autosave(
        conn: &mut SqliteConnection,
        media_key: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO media_usage (media_key, in_autosave, manual_refs, published_refs, last_seen_at)
            VALUES (?, 1, 0, 0, ?)
            ON CONFLICT(media_key) DO UPDATE SET in_autosave = 1, last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(media_key)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn upsert_pending_row(
        conn: &mut SqliteConnection,
        media_key: &str,
        requested_at: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO media_pending_deletions
                (media_key, requested_at, not_before, attempts, last_checked_at, last_error)
            VALUES (?, ?, ?, 0, NULL, NULL)
            ON CONFLICT(media_key) DO UPDATE SET
                requested_at = excluded.requested_at,
                not_before = excluded.not_before,
                attempts = 0,
                last_checked_at = NULL,
                last_error = NULL
            "#,
        )
        .bind(media_key)
        .bind(requested_at)
        .bind(not_before)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    #[async_trait]
    impl UsageRepo for SqliteStore {
        async fn get_usage(&self, media_key: &str) -> MetadataResult<Option<UsageRow>> {
            let row = sqlx::query_as::<_, UsageRow>("SELECT * FROM media_usage WHERE media_key = ?")
                .bind(media_key)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_usage(&self) -> MetadataResult<Vec<UsageRow>> {
            let rows = sqlx::query_as::<_, UsageRow>("SELECT * FROM media_usage ORDER BY media_key")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn existing_usage_keys(
            &self,
            media_keys: &[String],
        ) -> MetadataResult<HashSet<String>> {
            let mut found = HashSet::new();
            for batch in media_keys.chunks(BATCH_SIZE) {
                let placeholders: Vec<&str> = batch.iter().map(|_| "?").collect();
                let query = format!(
                    "SELECT media_key FROM media_usage WHERE media_key IN ({})",
                    placeholders.join(", ")
                );
                let mut query_builder = sqlx::query_scalar::<_, String>(&query);
                for key in batch {
                    query_builder = query_builder.bind(key);
                }
                found.extend(query_builder.fetch_all(&self.pool).await?);
            }
            Ok(found)
        }

        async fn sample_stale_usage(
            &self,
            older_than: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UsageRow>> {
            let rows = sqlx::query_as::<_, UsageRow>(
                r#"
                SELECT * FROM media_usage
                WHERE last_seen_at < ?
                ORDER BY last_seen_at, media_key
                LIMIT ?
                "#,
            )
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn sync_autosave(
            &self,
            media_keys: &[String],
            now: OffsetDateTime,
        ) -> MetadataResult<AutosaveSync> {
            let wanted: BTreeSet<&str> = media_keys.iter().map(String::as_str).collect();
            let mut tx = self.pool.begin().await?;

            let previous: Vec<String> =
                sqlx::query_scalar("SELECT media_key FROM media_usage WHERE in_autosave = 1")
                    .fetch_all(&mut *tx)
                    .await?;

            sqlx::query("UPDATE media_usage SET in_autosave = 0 WHERE in_autosave = 1")
                .execute(&mut *tx)
                .await?;

            for media_key in &wanted {
                flag_autosave(&mut tx, media_key, now).await?;
            }

            tx.commit().await?;

            let cleared = previous
                .iter()
                .filter(|key| !wanted.contains(key.as_str()))
                .count() as u64;
            Ok(AutosaveSync {
                flagged: wanted.len() as u64,
                cleared,
            })
        }

        async fn rebuild_usage(
            &self,
            snapshot: &UsageSnapshot,
            now: OffsetDateTime,
        ) -> MetadataResult<RebuildStats> {
            let mut stats = RebuildStats::default();
            let mut tx = self.pool.begin().await?;

            stats.rows_reset = sqlx::query(
                "UPDATE media_usage SET in_autosave = 0, manual_refs = 0, published_refs = 0",
            )
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let autosave: BTreeSet<&str> =
                snapshot.autosave_keys.iter().map(String::as_str).collect();
            for media_key in &autosave {
                flag_autosave(&mut tx, media_key, now).await?;
            }

            let mut seen_versions: HashSet<&str> = HashSet::new();
            for version in &snapshot.versions {
                if !seen_versions.insert(version.version_id.as_str()) {
                    tracing::warn!(
                        version_id = %version.version_id,
                        "Duplicate version in snapshot, ignoring repeat"
                    );
                    continue;
                }
                sqlx::query("DELETE FROM version_media WHERE version_id = ?")
                    .bind(&version.version_id)
                    .execute(&mut *tx)
                    .await?;
                let keys: BTreeSet<&str> = version.media_keys.iter().map(String::as_str).collect();
                stats.mappings_written +=
                    write_mapping(&mut tx, &version.version_id, version.kind, &keys, now).await?;
            }

            let mapped: Vec<String> =
                sqlx::query_scalar("SELECT DISTINCT version_id FROM version_media")
                    .fetch_all(&mut *tx)
                    .await?;
            for version_id in mapped {
                if seen_versions.contains(version_id.as_str()) {
                    continue;
                }
                stats.mappings_pruned += sqlx::query("DELETE FROM version_media WHERE version_id = ?")
                    .bind(&version_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }

            tx.commit().await?;

            stats.keys_upserted = snapshot.distinct_keys().len() as u64;
            Ok(stats)
        }
    }

    #[async_trait]
    impl VersionMediaRepo for SqliteStore {
        async fn version_media(&self, version_id: &str) -> MetadataResult<Vec<VersionMediaRow>> {
            let rows = sqlx::query_as::<_, VersionMediaRow>(
                "SELECT version_id, media_key, version_kind FROM version_media WHERE version_id = ? ORDER BY media_key",
            )
            .bind(version_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn mapped_versions(&self) -> MetadataResult<Vec<String>> {
            let ids = sqlx::query_scalar(
                "SELECT DISTINCT version_id FROM version_media ORDER BY version_id",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(ids)
        }

        async fn record_version(
            &self,
            version_id: &str,
            kind: VersionKind,
            media_keys: &[String],
            now: OffsetDateTime,
        ) -> MetadataResult<DecrementOutcome> {
            let keys: BTreeSet<&str> = media_keys.iter().map(String::as_str).collect();
            let mut tx = self.pool.begin().await?;
            let released = release_mapping(&mut tx, version_id).await?;
            write_mapping(&mut tx, version_id, kind, &keys, now).await?;
            tx.commit().await?;
            Ok(released)
        }

        async fn release_version(&self, version_id: &str) -> MetadataResult<DecrementOutcome> {
            let mut tx = self.pool.begin().await?;
            let released = release_mapping(&mut tx, version_id).await?;
            tx.commit().await?;
            Ok(released)
        }
    }

    #[async_trait]
    impl PendingDeletionRepo for SqliteStore {
        async fn upsert_pending(
            &self,
            media_key: &str,
            requested_at: OffsetDateTime,
            not_before: OffsetDateTime,
        ) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            upsert_pending_row(&mut conn, media_key, requested_at, not_before).await
        }

        async fn get_pending(
            &self,
            media_key: &str,
        ) -> MetadataResult<Option<PendingDeletionRow>> {
            let row = sqlx::query_as::<_, PendingDeletionRow>(
                "SELECT * FROM media_pending_deletions WHERE media_key = ?",
            )
            .bind(media_key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn due_pending(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<PendingDeletionRow>> {
            let rows = sqlx::query_as::<_, PendingDeletionRow>(
                r#"
                SELECT * FROM media_pending_deletions
                WHERE not_before <= ?
                ORDER BY not_before, media_key
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_pending(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media_pending_deletions")
                .fetch_one(&self.pool)
                .await?;
            Ok(count.max(0) as u64)
        }

        async fn remove_pending(&self, media_key: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM media_pending_deletions WHERE media_key = ?")
                .bind(media_key)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn reschedule_pending(
            &self,
            media_key: &str,
            checked_at: OffsetDateTime,
            not_before: OffsetDateTime,
            error: &str,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE media_pending_deletions
                SET attempts = attempts + 1,
                    last_checked_at = ?,
                    not_before = ?,
                    last_error = ?
                WHERE media_key = ?
                "#,
            )
            .bind(checked_at)
            .bind(not_before)
            .bind(error)
            .bind(media_key)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn complete_deletion(&self, media_key: &str) -> MetadataResult<ReclaimOutcome> {
            let mut tx = self.pool.begin().await?;

            let pending_removed =
                sqlx::query("DELETE FROM media_pending_deletions WHERE media_key = ?")
                    .bind(media_key)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                    > 0;

            // Only drop the ledger row if it is still unreferenced.
            let usage_removed = sqlx::query(
                r#"
                DELETE FROM media_usage
                WHERE media_key = ?
                  AND in_autosave = 0
                  AND manual_refs = 0
                  AND published_refs = 0
                "#,
            )
            .bind(media_key)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;

            let rereferenced = if usage_removed {
                false
            } else {
                let row: Option<(i32,)> =
                    sqlx::query_as("SELECT 1 FROM media_usage WHERE media_key = ?")
                        .bind(media_key)
                        .fetch_optional(&mut *tx)
                        .await?;
                row.is_some()
            };

            tx.commit().await?;

            Ok(ReclaimOutcome {
                pending_removed,
                usage_removed,
                rereferenced,
            })
        }
    }

    #[async_trait]
    impl DeadLetterRepo for SqliteStore {
        async fn dead_letter(
            &self,
            media_key: &str,
            attempts: i32,
            last_error: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let pending = sqlx::query_as::<_, PendingDeletionRow>(
                "SELECT * FROM media_pending_deletions WHERE media_key = ?",
            )
            .bind(media_key)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(pending) = pending else {
                return Ok(false);
            };

            sqlx::query(
                r#"
                INSERT INTO media_dead_letters
                    (media_key, attempts, last_error, requested_at, dead_lettered_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(media_key) DO UPDATE SET
                    attempts = excluded.attempts,
                    last_error = excluded.last_error,
                    requested_at = excluded.requested_at,
                    dead_lettered_at = excluded.dead_lettered_at
                "#,
            )
            .bind(media_key)
            .bind(attempts)
            .bind(last_error)
            .bind(pending.requested_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM media_pending_deletions WHERE media_key = ?")
                .bind(media_key)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(true)
        }

        async fn list_dead_letters(&self, limit: u32) -> MetadataResult<Vec<DeadLetterRow>> {
            let rows = sqlx::query_as::<_, DeadLetterRow>(
                "SELECT * FROM media_dead_letters ORDER BY dead_lettered_at DESC, media_key LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn requeue_dead_letter(
            &self,
            media_key: &str,
            now: OffsetDateTime,
            not_before: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let removed = sqlx::query("DELETE FROM media_dead_letters WHERE media_key = ?")
                .bind(media_key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if removed == 0 {
                return Ok(false);
            }

            upsert_pending_row(&mut tx, media_key, now, not_before).await?;
            tx.commit().await?;
            Ok(true)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Usage ledger: one row per managed key
CREATE TABLE IF NOT EXISTS media_usage (
    media_key TEXT PRIMARY KEY,
    in_autosave INTEGER NOT NULL DEFAULT 0,
    manual_refs INTEGER NOT NULL DEFAULT 0 CHECK (manual_refs >= 0),
    published_refs INTEGER NOT NULL DEFAULT 0 CHECK (published_refs >= 0),
    last_seen_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_media_usage_last_seen ON media_usage(last_seen_at);

-- Candidates awaiting their grace period
CREATE TABLE IF NOT EXISTS media_pending_deletions (
    media_key TEXT PRIMARY KEY,
    requested_at TEXT NOT NULL,
    not_before TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_checked_at TEXT,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_media_pending_not_before ON media_pending_deletions(not_before);

-- Version snapshot to media key mapping
CREATE TABLE IF NOT EXISTS version_media (
    version_id TEXT NOT NULL,
    media_key TEXT NOT NULL,
    version_kind TEXT NOT NULL CHECK (version_kind IN ('manual', 'published')),
    PRIMARY KEY (version_id, media_key)
);
CREATE INDEX IF NOT EXISTS idx_version_media_key ON version_media(media_key);

-- Deletions that exhausted their retry budget
CREATE TABLE IF NOT EXISTS media_dead_letters (
    media_key TEXT PRIMARY KEY,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    requested_at TEXT NOT NULL,
    dead_lettered_at TEXT NOT NULL
);
"#;
