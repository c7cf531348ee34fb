//! PostgreSQL-based metadata store implementation.

use crate::error::MetadataResult;
use crate::models::*;
use crate::repos::usage::counter_column;
use crate::repos::{
    AutosaveSync, DeadLetterRepo, DecrementOutcome, PendingDeletionRepo, RebuildStats,
    ReclaimOutcome, UsageRepo, UsageSnapshot, VersionMediaRepo,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use folio_core::VersionKind;
use folio_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a store from individual connection parameters.
    ///
    /// Lets the password arrive separately, e.g. through `FOLIO_METADATA__PASSWORD`.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::debug!(timeout_ms, "PostgreSQL statement_timeout set");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

async fn increment_refs(
    conn: &mut PgConnection,
    media_key: &str,
    kind: VersionKind,
    now: OffsetDateTime,
) -> MetadataResult<()> {
    let column = counter_column(kind);
    let sql = format!(
        "INSERT INTO media_usage (media_key, in_autosave, {column}, last_seen_at) \
         VALUES ($1, FALSE, 1, $2) \
         ON CONFLICT (media_key) DO UPDATE SET {column} = media_usage.{column} + 1, \
         last_seen_at = EXCLUDED.last_seen_at"
    );
    sqlx::query(&sql)
        .bind(media_key)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn decrement_refs(
    conn: &mut PgConnection,
    media_key: &str,
    kind: VersionKind,
) -> MetadataResult<bool> {
    let column = counter_column(kind);
    let sql = format!(
        "UPDATE media_usage SET {column} = {column} - 1 WHERE media_key = $1 AND {column} > 0"
    );
    let result = sqlx::query(&sql)
        .bind(media_key)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn release_mapping(
    conn: &mut PgConnection,
    version_id: &str,
) -> MetadataResult<DecrementOutcome> {
    // Lock the mapping rows so concurrent releases of one version serialise.
    let rows = sqlx::query_as::<_, VersionMediaRow>(
        "SELECT version_id, media_key, version_kind FROM version_media WHERE version_id = $1 FOR UPDATE",
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

    sqlx::query("DELETE FROM version_media WHERE version_id = $1")
        .bind(version_id)
        .execute(&mut *conn)
        .await?;

    Ok(outcome)
}

async fn write_mapping(
    conn: &mut PgConnection,
    version_id: &str,
    kind: VersionKind,
    media_keys: &BTreeSet<&str>,
    now: OffsetDateTime,
) -> MetadataResult<u64> {
    for &media_key in media_keys {
        sqlx::query(
            "INSERT INTO version_media (version_id, media_key, version_kind) VALUES ($1, $2, $3)",
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
    conn: &mut PgConnection,
    media_key: &str,
    now: OffsetDateTime,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO media_usage (media_key, in_autosave, manual_refs, published_refs, last_seen_at)
        VALUES ($1, TRUE, 0, 0, $2)
        ON CONFLICT (media_key) DO UPDATE SET in_autosave = TRUE, last_seen_at = EXCLUDED.last_seen_at
        "#,
    )
    .bind(media_key)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_pending_row(
    conn: &mut PgConnection,
    media_key: &str,
    requested_at: OffsetDateTime,
    not_before: OffsetDateTime,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO media_pending_deletions
            (media_key, requested_at, not_before, attempts, last_checked_at, last_error)
        VALUES ($1, $2, $3, 0, NULL, NULL)
        ON CONFLICT (media_key) DO UPDATE SET
            requested_at = EXCLUDED.requested_at,
            not_before = EXCLUDED.not_before,
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
impl UsageRepo for PostgresStore {
    async fn get_usage(&self, media_key: &str) -> MetadataResult<Option<UsageRow>> {
        let row = sqlx::query_as::<_, UsageRow>("SELECT * FROM media_usage WHERE media_key = $1")
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

    async fn existing_usage_keys(&self, media_keys: &[String]) -> MetadataResult<HashSet<String>> {
        if media_keys.is_empty() {
            return Ok(HashSet::new());
        }
        let found: Vec<String> =
            sqlx::query_scalar("SELECT media_key FROM media_usage WHERE media_key = ANY($1)")
                .bind(media_keys)
                .fetch_all(&self.pool)
                .await?;
        Ok(found.into_iter().collect())
    }

    async fn sample_stale_usage(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UsageRow>> {
        let rows = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT * FROM media_usage
            WHERE last_seen_at < $1
            ORDER BY last_seen_at, media_key
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(i64::from(limit))
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

        let previous: Vec<String> = sqlx::query_scalar(
            "SELECT media_key FROM media_usage WHERE in_autosave = TRUE FOR UPDATE",
        )
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("UPDATE media_usage SET in_autosave = FALSE WHERE in_autosave = TRUE")
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
            "UPDATE media_usage SET in_autosave = FALSE, manual_refs = 0, published_refs = 0",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let autosave: BTreeSet<&str> = snapshot.autosave_keys.iter().map(String::as_str).collect();
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
            sqlx::query("DELETE FROM version_media WHERE version_id = $1")
                .bind(&version.version_id)
                .execute(&mut *tx)
                .await?;
            let keys: BTreeSet<&str> = version.media_keys.iter().map(String::as_str).collect();
            stats.mappings_written +=
                write_mapping(&mut tx, &version.version_id, version.kind, &keys, now).await?;
        }

        let keep: Vec<String> = seen_versions.iter().map(|id| id.to_string()).collect();
        stats.mappings_pruned = sqlx::query("DELETE FROM version_media WHERE NOT (version_id = ANY($1))")
            .bind(&keep)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        stats.keys_upserted = snapshot.distinct_keys().len() as u64;
        Ok(stats)
    }
}

#[async_trait]
impl VersionMediaRepo for PostgresStore {
    async fn version_media(&self, version_id: &str) -> MetadataResult<Vec<VersionMediaRow>> {
        let rows = sqlx::query_as::<_, VersionMediaRow>(
            "SELECT version_id, media_key, version_kind FROM version_media WHERE version_id = $1 ORDER BY media_key",
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mapped_versions(&self) -> MetadataResult<Vec<String>> {
        let ids =
            sqlx::query_scalar("SELECT DISTINCT version_id FROM version_media ORDER BY version_id")
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
impl PendingDeletionRepo for PostgresStore {
    async fn upsert_pending(
        &self,
        media_key: &str,
        requested_at: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> MetadataResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_pending_row(&mut conn, media_key, requested_at, not_before).await
    }

    async fn get_pending(&self, media_key: &str) -> MetadataResult<Option<PendingDeletionRow>> {
        let row = sqlx::query_as::<_, PendingDeletionRow>(
            "SELECT * FROM media_pending_deletions WHERE media_key = $1",
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
            WHERE not_before <= $1
            ORDER BY not_before, media_key
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
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
        let result = sqlx::query("DELETE FROM media_pending_deletions WHERE media_key = $1")
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
                last_checked_at = $1,
                not_before = $2,
                last_error = $3
            WHERE media_key = $4
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
            sqlx::query("DELETE FROM media_pending_deletions WHERE media_key = $1")
                .bind(media_key)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;

        let usage_removed = sqlx::query(
            r#"
            DELETE FROM media_usage
            WHERE media_key = $1
              AND in_autosave = FALSE
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
                sqlx::query_as("SELECT 1 FROM media_usage WHERE media_key = $1")
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
impl DeadLetterRepo for PostgresStore {
    async fn dead_letter(
        &self,
        media_key: &str,
        attempts: i32,
        last_error: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;

        let pending = sqlx::query_as::<_, PendingDeletionRow>(
            "SELECT * FROM media_pending_deletions WHERE media_key = $1 FOR UPDATE",
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
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (media_key) DO UPDATE SET
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                requested_at = EXCLUDED.requested_at,
                dead_lettered_at = EXCLUDED.dead_lettered_at
            "#,
        )
        .bind(media_key)
        .bind(attempts)
        .bind(last_error)
        .bind(pending.requested_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM media_pending_deletions WHERE media_key = $1")
            .bind(media_key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_dead_letters(&self, limit: u32) -> MetadataResult<Vec<DeadLetterRow>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT * FROM media_dead_letters ORDER BY dead_lettered_at DESC, media_key LIMIT $1",
        )
        .bind(i64::from(limit))
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

        let removed = sqlx::query("DELETE FROM media_dead_letters WHERE media_key = $1")
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
