use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use time::OffsetDateTime;

use crate::{
    application::repos::{
        CacheComposition, ExpirationWindow, RepoError, SearchCacheRepo, SearchCacheRow,
        SearchCacheUpsert,
    },
    cache::KeyPattern,
    config::DatabaseSettings,
};

use super::util::{
    convert_count, from_epoch_millis, like_prefix, map_sqlx_error, to_epoch_millis, to_i64,
};

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(sqlx::FromRow)]
struct SearchCacheRecord {
    search_hash: String,
    query_params: String,
    chunk_ids: String,
    result_count: i64,
    created_at: i64,
    expires_at: i64,
    hit_count: i64,
}

impl TryFrom<SearchCacheRecord> for SearchCacheRow {
    type Error = RepoError;

    fn try_from(row: SearchCacheRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            search_hash: row.search_hash,
            query_params: serde_json::from_str(&row.query_params)
                .map_err(RepoError::from_persistence)?,
            result_ids: serde_json::from_str(&row.chunk_ids)
                .map_err(RepoError::from_persistence)?,
            result_count: row.result_count,
            created_at: from_epoch_millis(row.created_at)?,
            expires_at: from_epoch_millis(row.expires_at)?,
            hit_count: row.hit_count,
        })
    }
}

/// Search cache table on SQLite (epoch-millisecond integers, JSON text).
#[derive(Clone)]
pub struct SqliteSearchCacheRepo {
    pool: Arc<SqlitePool>,
}

impl SqliteSearchCacheRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a pool for `url`. An in-memory database lives in a single
    /// connection, so such pools are pinned to one connection that never
    /// idles out.
    pub async fn connect(
        settings: &DatabaseSettings,
        url: &str,
    ) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(settings.max_connections.get())
        };

        pool_options
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations/sqlite")
            .run(self.pool())
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl SearchCacheRepo for SqliteSearchCacheRepo {
    async fn find_live(
        &self,
        search_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<SearchCacheRow>, RepoError> {
        let row = sqlx::query_as::<_, SearchCacheRecord>(
            r#"
            SELECT search_hash, query_params, chunk_ids, result_count, created_at, expires_at,
                   hit_count
            FROM chunk_search_cache
            WHERE search_hash = ?1 AND expires_at > ?2
            "#,
        )
        .bind(search_hash)
        .bind(to_epoch_millis(now))
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(SearchCacheRow::try_from).transpose()
    }

    async fn upsert(&self, row: &SearchCacheUpsert) -> Result<(), RepoError> {
        let query_params =
            serde_json::to_string(&row.query_params).map_err(RepoError::from_persistence)?;
        let chunk_ids =
            serde_json::to_string(&row.result_ids).map_err(RepoError::from_persistence)?;
        let result_count = to_i64(row.result_ids.len() as u64, "result count")?;

        sqlx::query(
            r#"
            INSERT INTO chunk_search_cache
                (search_hash, query_params, chunk_ids, result_count, created_at, expires_at,
                 hit_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
            ON CONFLICT (search_hash) DO UPDATE SET
                query_params = excluded.query_params,
                chunk_ids = excluded.chunk_ids,
                result_count = excluded.result_count,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                hit_count = 0
            "#,
        )
        .bind(&row.search_hash)
        .bind(query_params)
        .bind(chunk_ids)
        .bind(result_count)
        .bind(to_epoch_millis(row.created_at))
        .bind(to_epoch_millis(row.expires_at))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn increment_hit_count(&self, search_hash: &str, by: u64) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE chunk_search_cache SET hit_count = hit_count + ?2 WHERE search_hash = ?1",
        )
        .bind(search_hash)
        .bind(to_i64(by, "hit increment")?)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn count_entries(&self) -> Result<u64, RepoError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_search_cache")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        convert_count(count)
    }

    async fn delete_oldest(&self, count: u64) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            DELETE FROM chunk_search_cache
            WHERE search_hash IN (
                SELECT search_hash FROM chunk_search_cache
                ORDER BY created_at ASC
                LIMIT ?1
            )
            "#,
        )
        .bind(to_i64(count, "delete count")?)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM chunk_search_cache WHERE expires_at <= ?1")
            .bind(to_epoch_millis(now))
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, RepoError> {
        let query = match pattern {
            KeyPattern::All => sqlx::query("DELETE FROM chunk_search_cache"),
            KeyPattern::Prefix(prefix) => {
                sqlx::query(r"DELETE FROM chunk_search_cache WHERE search_hash LIKE ?1 ESCAPE '\'")
                    .bind(like_prefix(prefix))
            }
            KeyPattern::Exact(hash) => {
                sqlx::query("DELETE FROM chunk_search_cache WHERE search_hash = ?1")
                    .bind(hash.as_str())
            }
        };

        let result = query
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn composition(&self, now: OffsetDateTime) -> Result<CacheComposition, RepoError> {
        let (total, expired, average_hit_count, size_bytes): (i64, i64, f64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(AVG(CAST(hit_count AS REAL)), 0.0),
                    COALESCE(SUM(LENGTH(query_params) + result_count * 36), 0)
                FROM chunk_search_cache
                "#,
            )
            .bind(to_epoch_millis(now))
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(CacheComposition {
            total_entries: convert_count(total)?,
            expired_entries: convert_count(expired)?,
            average_hit_count,
            size_bytes: convert_count(size_bytes)?,
        })
    }

    async fn top_by_hits(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<SearchCacheRow>, RepoError> {
        let rows = sqlx::query_as::<_, SearchCacheRecord>(
            r#"
            SELECT search_hash, query_params, chunk_ids, result_count, created_at, expires_at,
                   hit_count
            FROM chunk_search_cache
            WHERE expires_at > ?1
            ORDER BY hit_count DESC, created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(to_epoch_millis(now))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(SearchCacheRow::try_from).collect()
    }

    async fn expiration_window(&self, now: OffsetDateTime) -> Result<ExpirationWindow, RepoError> {
        let (expiring, expired, average_ttl_seconds): (i64, i64, f64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN expires_at > ?1 AND expires_at <= ?1 + ?2
                    THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN expires_at <= ?1 AND expires_at > ?1 - ?3
                    THEN 1 ELSE 0 END), 0),
                COALESCE(AVG((expires_at - created_at) / 1000.0), 0.0)
            FROM chunk_search_cache
            "#,
        )
        .bind(to_epoch_millis(now))
        .bind(HOUR_MS)
        .bind(DAY_MS)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(ExpirationWindow {
            expiring_next_hour: convert_count(expiring)?,
            expired_last_day: convert_count(expired)?,
            average_ttl_seconds,
        })
    }
}
