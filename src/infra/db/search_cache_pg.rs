use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;

use crate::{
    application::repos::{
        CacheComposition, ExpirationWindow, RepoError, SearchCacheRepo, SearchCacheRow,
        SearchCacheUpsert,
    },
    cache::KeyPattern,
    config::DatabaseSettings,
};

use super::util::{convert_count, like_prefix, map_sqlx_error, to_i64};

#[derive(sqlx::FromRow)]
struct SearchCacheRecord {
    search_hash: String,
    query_params: Value,
    chunk_ids: Vec<String>,
    result_count: i64,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    hit_count: i64,
}

impl From<SearchCacheRecord> for SearchCacheRow {
    fn from(row: SearchCacheRecord) -> Self {
        Self {
            search_hash: row.search_hash,
            query_params: row.query_params,
            result_ids: row.chunk_ids,
            result_count: row.result_count,
            created_at: row.created_at,
            expires_at: row.expires_at,
            hit_count: row.hit_count,
        }
    }
}

/// Search cache table on Postgres (`TIMESTAMPTZ`, `TEXT[]`, `JSONB`).
#[derive(Clone)]
pub struct PostgresSearchCacheRepo {
    pool: Arc<PgPool>,
}

impl PostgresSearchCacheRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(settings: &DatabaseSettings, url: &str) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(settings.max_connections.get())
            .acquire_timeout(settings.acquire_timeout)
            .connect(url)
            .await
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations/postgres")
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
impl SearchCacheRepo for PostgresSearchCacheRepo {
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
            WHERE search_hash = $1 AND expires_at > $2
            "#,
        )
        .bind(search_hash)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(SearchCacheRow::from))
    }

    async fn upsert(&self, row: &SearchCacheUpsert) -> Result<(), RepoError> {
        let result_count = to_i64(row.result_ids.len() as u64, "result count")?;
        sqlx::query(
            r#"
            INSERT INTO chunk_search_cache
                (search_hash, query_params, chunk_ids, result_count, created_at, expires_at,
                 hit_count)
            VALUES ($1, $2, $3, $4, $5, $6, 0)
            ON CONFLICT (search_hash) DO UPDATE SET
                query_params = EXCLUDED.query_params,
                chunk_ids = EXCLUDED.chunk_ids,
                result_count = EXCLUDED.result_count,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                hit_count = 0
            "#,
        )
        .bind(&row.search_hash)
        .bind(&row.query_params)
        .bind(&row.result_ids)
        .bind(result_count)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn increment_hit_count(&self, search_hash: &str, by: u64) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE chunk_search_cache SET hit_count = hit_count + $2 WHERE search_hash = $1",
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
                LIMIT $1
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
        let result = sqlx::query("DELETE FROM chunk_search_cache WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, RepoError> {
        let query = match pattern {
            KeyPattern::All => sqlx::query("DELETE FROM chunk_search_cache"),
            KeyPattern::Prefix(prefix) => {
                sqlx::query(r"DELETE FROM chunk_search_cache WHERE search_hash LIKE $1 ESCAPE '\'")
                    .bind(like_prefix(prefix))
            }
            KeyPattern::Exact(hash) => {
                sqlx::query("DELETE FROM chunk_search_cache WHERE search_hash = $1")
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
                    COUNT(*) FILTER (WHERE expires_at <= $1),
                    COALESCE(AVG(hit_count), 0)::float8,
                    COALESCE(SUM(octet_length(query_params::text) + result_count * 36), 0)::bigint
                FROM chunk_search_cache
                "#,
            )
            .bind(now)
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
            WHERE expires_at > $1
            ORDER BY hit_count DESC, created_at DESC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(SearchCacheRow::from).collect())
    }

    async fn expiration_window(&self, now: OffsetDateTime) -> Result<ExpirationWindow, RepoError> {
        let (expiring, expired, average_ttl_seconds): (i64, i64, f64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE expires_at > $1 AND expires_at <= $1 + INTERVAL '1 hour'
                ),
                COUNT(*) FILTER (
                    WHERE expires_at <= $1 AND expires_at > $1 - INTERVAL '1 day'
                ),
                COALESCE(AVG(EXTRACT(EPOCH FROM (expires_at - created_at))), 0)::float8
            FROM chunk_search_cache
            "#,
        )
        .bind(now)
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
