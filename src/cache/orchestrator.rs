//! Read-through coordination across the cache tiers.
//!
//! A lookup checks the volatile tier, then (for searches) the persistent tier,
//! and only on a full miss runs the query against the chunk service. Cache
//! tier failures never reach the caller: reads fall through as misses and
//! writes are logged, counted and dropped. Only the query's own error is
//! returned.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::Duration;
use tracing::{debug, info, warn};

use crate::application::repos::{SearchCacheRepo, SearchCacheRow};
use crate::domain::entities::ChunkRecord;
use crate::domain::search::SearchResult;

use super::config::{CacheConfig, TtlPolicy};
use super::error::CacheError;
use super::invalidation::InvalidationPlan;
use super::keys::{CacheKey, Dependency, KeyPattern, QueryParams, derive_key};
use super::persistent::{PersistentStore, SearchTier};
use super::store::{VolatileStats, VolatileTier};

const METRIC_QUERY_TOTAL: &str = "chunk_cache_query_total";
const METRIC_QUERY_MS: &str = "chunk_cache_query_ms";
const METRIC_RESULT_SIZE: &str = "chunk_cache_result_size";
const METRIC_SET_ERROR: &str = "chunk_cache_set_error_total";
const METRIC_READ_ERROR: &str = "chunk_cache_read_error_total";
const METRIC_INVALIDATION: &str = "chunk_cache_invalidation_total";

/// A value that can be cached and measured.
pub trait QueryResult: Serialize + DeserializeOwned + Send {
    /// Size recorded with the query metric (row count for collections).
    fn result_size(&self) -> usize;

    /// Chunks contained in the result; cached entries depend on them.
    fn chunk_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

impl QueryResult for ChunkRecord {
    fn result_size(&self) -> usize {
        1
    }

    fn chunk_ids(&self) -> Vec<String> {
        vec![self.chunk_id.clone()]
    }
}

impl QueryResult for Vec<ChunkRecord> {
    fn result_size(&self) -> usize {
        self.len()
    }

    fn chunk_ids(&self) -> Vec<String> {
        self.iter().map(|chunk| chunk.chunk_id.clone()).collect()
    }
}

impl QueryResult for SearchResult {
    fn result_size(&self) -> usize {
        self.chunks.len()
    }

    fn chunk_ids(&self) -> Vec<String> {
        self.chunks.chunk_ids()
    }
}

impl QueryResult for Vec<String> {
    fn result_size(&self) -> usize {
        self.len()
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served by the volatile tier.
    Hit,
    /// Rebuilt from identifiers held by the persistent tier.
    PersistentHit,
    /// Computed by the chunk service.
    Miss,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::PersistentHit => "persistent_hit",
            CacheOutcome::Miss => "miss",
        }
    }

    pub fn is_cached(self) -> bool {
        !matches!(self, CacheOutcome::Miss)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub outcome: CacheOutcome,
}

/// How a search is looked up in and written to the persistent tier.
#[derive(Debug, Clone, Copy)]
pub struct PersistentLookup<'a> {
    pub params: &'a QueryParams,
    pub ttl: Duration,
}

/// Counts of what an invalidation removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub volatile_removed: usize,
    pub persistent_removed: u64,
}

#[derive(Clone)]
pub struct QueryCache {
    volatile: VolatileTier,
    persistent: SearchTier,
    ttl: TtlPolicy,
}

impl QueryCache {
    pub fn new(volatile: VolatileTier, persistent: SearchTier, ttl: TtlPolicy) -> Self {
        Self {
            volatile,
            persistent,
            ttl,
        }
    }

    /// Build both tiers from configuration and start their background tasks.
    ///
    /// The persistent tier is only enabled when a repository is supplied.
    pub fn from_config(config: &CacheConfig, repo: Option<Arc<dyn SearchCacheRepo>>) -> Self {
        let persistent = match repo {
            Some(repo) if config.enable_persistent_cache => {
                SearchTier::Database(Arc::new(PersistentStore::start(repo, config.clone())))
            }
            _ => SearchTier::Disabled,
        };
        Self::new(
            VolatileTier::from_config(config),
            persistent,
            config.ttl_policy(),
        )
    }

    /// Both tiers disabled; every call goes to the query function.
    pub fn disabled() -> Self {
        Self::new(
            VolatileTier::Disabled,
            SearchTier::Disabled,
            TtlPolicy::default(),
        )
    }

    pub fn volatile(&self) -> &VolatileTier {
        &self.volatile
    }

    pub fn persistent(&self) -> &SearchTier {
        &self.persistent
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Key for a volatile entry, or `None` when the volatile tier is off.
    pub fn generate_cache_key(
        &self,
        kind: &str,
        identifier: &str,
        params: &QueryParams,
    ) -> Option<CacheKey> {
        self.volatile
            .is_enabled()
            .then(|| derive_key(kind, identifier, params))
    }

    /// Cached value under `key`; decode failures count as a miss.
    pub fn get_cached_result<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        match self.volatile.get(key.as_str()) {
            Ok(value) => value,
            Err(err) => {
                counter!(METRIC_READ_ERROR, "tier" => "volatile").increment(1);
                warn!(key = %key, error = %err, "Unreadable volatile cache entry, treating as miss");
                None
            }
        }
    }

    pub fn set_cached_result<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.volatile
            .set_with_dependencies(key.as_str(), value, ttl, HashSet::new())
    }

    /// Delete volatile entries matching any of `patterns`.
    pub fn invalidate_cache_patterns(&self, patterns: &[KeyPattern]) -> usize {
        patterns
            .iter()
            .map(|pattern| self.volatile.delete_pattern(pattern))
            .sum()
    }

    /// Read-through over the volatile tier.
    pub async fn execute_with_cache<T, E, F, Fut>(
        &self,
        key: Option<&CacheKey>,
        kind: &str,
        query: F,
    ) -> Result<Fetched<T>, E>
    where
        T: QueryResult,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_tracked(key, kind, HashSet::new(), query).await
    }

    /// Like `execute_with_cache`, registering the stored entry against
    /// `dependencies` and every chunk in the result.
    pub async fn execute_tracked<T, E, F, Fut>(
        &self,
        key: Option<&CacheKey>,
        kind: &str,
        dependencies: HashSet<Dependency>,
        query: F,
    ) -> Result<Fetched<T>, E>
    where
        T: QueryResult,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(key, kind) {
            return Ok(Fetched {
                value,
                outcome: CacheOutcome::Hit,
            });
        }

        let value = self.run_query(kind, query).await?;
        self.store(key, kind, &value, dependencies);
        Ok(Fetched {
            value,
            outcome: CacheOutcome::Miss,
        })
    }

    /// Read-through over both tiers for searches.
    ///
    /// The persistent tier only holds result identifiers; `rebuild` turns a
    /// stored row back into a full result. If rebuilding fails the search
    /// runs against the source as on a miss.
    pub async fn execute_search_with_cache<T, E, Q, QFut, R, RFut>(
        &self,
        key: Option<&CacheKey>,
        kind: &str,
        lookup: PersistentLookup<'_>,
        dependencies: HashSet<Dependency>,
        query: Q,
        rebuild: R,
    ) -> Result<Fetched<T>, E>
    where
        T: QueryResult,
        E: Display,
        Q: FnOnce() -> QFut,
        QFut: Future<Output = Result<T, E>>,
        R: FnOnce(SearchCacheRow) -> RFut,
        RFut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(key, kind) {
            return Ok(Fetched {
                value,
                outcome: CacheOutcome::Hit,
            });
        }

        match self.persistent.get_cached_search(lookup.params).await {
            Ok(Some(row)) => {
                let search_hash = row.search_hash.clone();
                match rebuild(row).await {
                    Ok(value) => {
                        record_outcome(kind, CacheOutcome::PersistentHit);
                        self.store(key, kind, &value, dependencies);
                        return Ok(Fetched {
                            value,
                            outcome: CacheOutcome::PersistentHit,
                        });
                    }
                    Err(err) => warn!(
                        kind,
                        search_hash = %search_hash,
                        error = %err,
                        "Failed to rebuild persisted search result, querying source"
                    ),
                }
            }
            Ok(None) => {}
            Err(err) => {
                counter!(METRIC_READ_ERROR, "tier" => "persistent").increment(1);
                warn!(
                    kind,
                    error_kind = err.kind(),
                    error = %err,
                    "Persistent search cache read failed, treating as miss"
                );
            }
        }

        let value = self.run_query(kind, query).await?;
        if let Err(err) = self
            .persistent
            .set_cached_search(lookup.params, &value.chunk_ids(), lookup.ttl)
            .await
        {
            counter!(METRIC_SET_ERROR, "tier" => "persistent").increment(1);
            warn!(kind, error = %err, "Failed to store search result in persistent cache");
        }
        self.store(key, kind, &value, dependencies);
        Ok(Fetched {
            value,
            outcome: CacheOutcome::Miss,
        })
    }

    /// Apply an invalidation plan to both tiers. Failures are logged and dropped.
    pub async fn invalidate(&self, plan: &InvalidationPlan) -> InvalidationReport {
        let mut report = InvalidationReport {
            volatile_removed: self.invalidate_cache_patterns(&plan.volatile_patterns),
            ..Default::default()
        };
        if !plan.dependencies.is_empty() {
            report.volatile_removed += self.volatile.delete_dependents(&plan.dependencies);
        }
        counter!(METRIC_INVALIDATION, "tier" => "volatile").increment(1);

        if !plan.persistent_patterns.is_empty() {
            match self
                .persistent
                .invalidate_search_cache(&plan.persistent_patterns)
                .await
            {
                Ok(removed) => {
                    report.persistent_removed = removed;
                    counter!(METRIC_INVALIDATION, "tier" => "persistent").increment(1);
                }
                Err(err) => {
                    counter!(METRIC_SET_ERROR, "tier" => "persistent").increment(1);
                    warn!(
                        error_kind = err.kind(),
                        error = %err,
                        "Persistent search cache invalidation failed"
                    );
                }
            }
        }

        info!(
            reason = plan.reason,
            volatile_removed = report.volatile_removed,
            persistent_removed = report.persistent_removed,
            "Cache invalidated"
        );
        report
    }

    pub fn volatile_stats(&self) -> VolatileStats {
        self.volatile.stats()
    }

    /// Stop background tasks of both tiers.
    pub async fn shutdown(&self) {
        self.volatile.shutdown().await;
        self.persistent.shutdown().await;
    }

    fn lookup<T: DeserializeOwned>(&self, key: Option<&CacheKey>, kind: &str) -> Option<T> {
        let key = key?;
        let value = self.get_cached_result(key)?;
        record_outcome(kind, CacheOutcome::Hit);
        debug!(kind, key = %key, "Query cache hit");
        Some(value)
    }

    async fn run_query<T, E, F, Fut>(&self, kind: &str, query: F) -> Result<T, E>
    where
        T: QueryResult,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started_at = Instant::now();
        let result = query().await;
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_QUERY_MS, "kind" => kind.to_string()).record(elapsed_ms);

        match result {
            Ok(value) => {
                record_outcome(kind, CacheOutcome::Miss);
                histogram!(METRIC_RESULT_SIZE, "kind" => kind.to_string())
                    .record(value.result_size() as f64);
                debug!(kind, elapsed_ms, size = value.result_size(), "Query cache miss");
                Ok(value)
            }
            Err(err) => {
                counter!(METRIC_QUERY_TOTAL, "kind" => kind.to_string(), "outcome" => "error")
                    .increment(1);
                debug!(kind, elapsed_ms, error = %err, "Query failed, nothing cached");
                Err(err)
            }
        }
    }

    fn store<T: QueryResult>(
        &self,
        key: Option<&CacheKey>,
        kind: &str,
        value: &T,
        mut dependencies: HashSet<Dependency>,
    ) {
        let Some(key) = key else {
            return;
        };

        dependencies.extend(value.chunk_ids().into_iter().map(Dependency::Chunk));
        let ttl = self.ttl.ttl_for(kind);
        if let Err(err) = self
            .volatile
            .set_with_dependencies(key.as_str(), value, ttl, dependencies)
        {
            counter!(METRIC_SET_ERROR, "tier" => "volatile").increment(1);
            warn!(kind, key = %key, error = %err, "Failed to store query result in volatile cache");
        }
    }
}

fn record_outcome(kind: &str, outcome: CacheOutcome) {
    counter!(
        METRIC_QUERY_TOTAL,
        "kind" => kind.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}
