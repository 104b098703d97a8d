//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::KeyPattern;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// A persisted search result: the identifiers of the matching chunks plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCacheRow {
    pub search_hash: String,
    pub query_params: Value,
    pub result_ids: Vec<String>,
    pub result_count: i64,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub hit_count: i64,
}

/// Values written by an upsert. `hit_count` always restarts at zero.
#[derive(Debug, Clone)]
pub struct SearchCacheUpsert {
    pub search_hash: String,
    pub query_params: Value,
    pub result_ids: Vec<String>,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Table-wide aggregates used by stats.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheComposition {
    pub total_entries: u64,
    pub expired_entries: u64,
    pub average_hit_count: f64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExpirationWindow {
    pub expiring_next_hour: u64,
    pub expired_last_day: u64,
    pub average_ttl_seconds: f64,
}

#[async_trait]
pub trait SearchCacheRepo: Send + Sync {
    /// Row for `search_hash` whose expiry is after `now`.
    async fn find_live(
        &self,
        search_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<SearchCacheRow>, RepoError>;

    async fn upsert(&self, row: &SearchCacheUpsert) -> Result<(), RepoError>;

    async fn increment_hit_count(&self, search_hash: &str, by: u64) -> Result<(), RepoError>;

    async fn count_entries(&self) -> Result<u64, RepoError>;

    /// Delete the `count` rows with the oldest `created_at`.
    async fn delete_oldest(&self, count: u64) -> Result<u64, RepoError>;

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError>;

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, RepoError>;

    async fn composition(&self, now: OffsetDateTime) -> Result<CacheComposition, RepoError>;

    /// Live rows ordered by hit count, highest first.
    async fn top_by_hits(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<SearchCacheRow>, RepoError>;

    async fn expiration_window(&self, now: OffsetDateTime) -> Result<ExpirationWindow, RepoError>;
}
