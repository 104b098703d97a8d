//! Persistent (database-backed) search cache.
//!
//! Stores the identifiers of the chunks a search returned, keyed by the hash
//! of its normalized parameters. Rows expire, are capped in number (oldest
//! `created_at` goes first) and carry a hit counter for analytics.
//!
//! `search_hash` is a content digest. Pattern invalidation therefore only
//! narrows by literal hash prefix; only `*` reliably removes the rows a
//! mutation may have made stale.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use metrics::histogram;
use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{
    ExpirationWindow, RepoError, SearchCacheRepo, SearchCacheRow, SearchCacheUpsert,
};

use super::advisor::{self, OptimizationSuggestion};
use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::{KeyPattern, QueryParams, search_hash};
use super::lock::mutex_lock;
use super::maintenance::{MaintenancePlan, MaintenanceQueue, MaintenanceTask};
use super::task::BackgroundTask;

const SOURCE: &str = "cache::persistent";

const METRIC_MAINTENANCE_MS: &str = "chunk_cache_maintenance_ms";

// ============================================================================
// Stats
// ============================================================================

/// A frequently served row, as reported by stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopQuery {
    pub search_hash: String,
    pub query_params: Value,
    pub hit_count: i64,
    pub result_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl From<SearchCacheRow> for TopQuery {
    fn from(row: SearchCacheRow) -> Self {
        Self {
            search_hash: row.search_hash,
            query_params: row.query_params,
            hit_count: row.hit_count,
            result_count: row.result_count,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

/// Snapshot of the persistent tier.
///
/// `hit_rate` is `(total - expired) / total`: the live share of the table,
/// not a ratio of served requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchCacheStats {
    pub total_entries: u64,
    pub expired_entries: u64,
    pub average_hit_count: f64,
    pub hit_rate: f64,
    pub cache_size_bytes: u64,
    pub top_queries: Vec<TopQuery>,
    pub expiration: ExpirationWindow,
}

// ============================================================================
// Store
// ============================================================================

struct Inner {
    repo: Arc<dyn SearchCacheRepo>,
    config: CacheConfig,
    queue: MaintenanceQueue,
}

pub struct PersistentStore {
    inner: Arc<Inner>,
    worker: Mutex<Option<BackgroundTask>>,
}

impl PersistentStore {
    /// Create a store without a maintenance worker; call `flush_maintenance`
    /// to apply queued work.
    pub fn new(repo: Arc<dyn SearchCacheRepo>, config: CacheConfig) -> Self {
        let queue = MaintenanceQueue::new(config.maintenance_queue_limit);
        Self {
            inner: Arc::new(Inner {
                repo,
                config,
                queue,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Create a store and start its maintenance worker on the current runtime.
    pub fn start(repo: Arc<dyn SearchCacheRepo>, config: CacheConfig) -> Self {
        let store = Self::new(repo, config);
        store.spawn_worker();
        store
    }

    /// Start the worker that applies queued maintenance and sweeps expired rows.
    pub fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        let cleanup_interval = inner.config.persistent_cleanup_interval();
        let task = BackgroundTask::spawn("persistent_maintenance", move |token| async move {
            let mut cleanup = tokio::time::interval_at(
                tokio::time::Instant::now() + cleanup_interval,
                cleanup_interval,
            );
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        inner.run_maintenance().await;
                        break;
                    }
                    _ = inner.queue.notified() => inner.run_maintenance().await,
                    _ = cleanup.tick() => {
                        if let Err(err) = inner.cleanup_expired().await {
                            warn!(error = %err, "Scheduled search cache cleanup failed");
                        }
                    }
                }
            }
        });

        let previous = mutex_lock(&self.worker, SOURCE, "spawn_worker").replace(task);
        drop(previous);
    }

    /// Stop the worker, applying whatever is still queued.
    pub async fn shutdown(&self) {
        let task = mutex_lock(&self.worker, SOURCE, "shutdown").take();
        match task {
            Some(task) => task.shutdown().await,
            None => self.inner.run_maintenance().await,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Live row for `params`, or `None`. A hit queues a hit-count increment.
    pub async fn get_cached_search(
        &self,
        params: &QueryParams,
    ) -> Result<Option<SearchCacheRow>, CacheError> {
        let hash = search_hash(params)?;
        let inner = &self.inner;
        let row = inner
            .with_timeout(
                "find_live",
                inner.repo.find_live(&hash, OffsetDateTime::now_utc()),
            )
            .await?;

        if row.is_some() {
            self.update_hit_count(&hash);
            debug!(search_hash = %hash, "Persistent search cache hit");
        }
        Ok(row)
    }

    /// Upsert the result identifiers for `params`; the hit count restarts at zero.
    pub async fn set_cached_search(
        &self,
        params: &QueryParams,
        result_ids: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let search_hash = search_hash(params)?;
        let now = OffsetDateTime::now_utc();
        let row = SearchCacheUpsert {
            search_hash,
            query_params: params.to_json()?,
            result_ids: result_ids.to_vec(),
            created_at: now,
            expires_at: now.saturating_add(ttl),
        };

        let inner = &self.inner;
        inner
            .with_timeout("upsert", inner.repo.upsert(&row))
            .await?;
        inner.queue.publish(MaintenanceTask::EnforceCapacity);
        debug!(
            search_hash = %row.search_hash,
            results = result_ids.len(),
            "Persistent search cache stored"
        );
        Ok(())
    }

    /// Queue a hit-count increment. Best effort: dropped when the queue is full.
    pub fn update_hit_count(&self, search_hash: &str) {
        self.inner.queue.publish(MaintenanceTask::RecordHit {
            search_hash: search_hash.to_string(),
        });
    }

    /// Delete rows matching any of `patterns`. Returns the number deleted.
    pub async fn invalidate_search_cache(
        &self,
        patterns: &[KeyPattern],
    ) -> Result<u64, CacheError> {
        let inner = &self.inner;
        let mut deleted = 0;
        for pattern in patterns {
            deleted += inner
                .with_timeout("delete_matching", inner.repo.delete_matching(pattern))
                .await?;
        }
        info!(
            patterns = patterns.len(),
            deleted, "Invalidated persistent search cache"
        );
        Ok(deleted)
    }

    pub async fn cleanup_expired_entries(&self) -> Result<u64, CacheError> {
        self.inner.cleanup_expired().await
    }

    pub async fn get_cache_stats(&self) -> Result<SearchCacheStats, CacheError> {
        let inner = &self.inner;
        if !inner.config.enable_stats {
            return Ok(SearchCacheStats::default());
        }

        let now = OffsetDateTime::now_utc();
        let composition = inner
            .with_timeout("composition", inner.repo.composition(now))
            .await?;
        let top = inner
            .with_timeout(
                "top_by_hits",
                inner.repo.top_by_hits(now, inner.config.top_queries_limit),
            )
            .await?;
        let expiration = inner
            .with_timeout("expiration_window", inner.repo.expiration_window(now))
            .await?;

        let hit_rate = if composition.total_entries == 0 {
            0.0
        } else {
            composition
                .total_entries
                .saturating_sub(composition.expired_entries) as f64
                / composition.total_entries as f64
        };

        Ok(SearchCacheStats {
            total_entries: composition.total_entries,
            expired_entries: composition.expired_entries,
            average_hit_count: composition.average_hit_count,
            hit_rate,
            cache_size_bytes: composition.size_bytes,
            top_queries: top.into_iter().map(TopQuery::from).collect(),
            expiration,
        })
    }

    pub async fn get_optimization_suggestions(
        &self,
    ) -> Result<Vec<OptimizationSuggestion>, CacheError> {
        if !self.inner.config.enable_optimization {
            return Ok(Vec::new());
        }
        let stats = self.get_cache_stats().await?;
        Ok(advisor::suggest(&stats, &self.inner.config))
    }

    /// Apply every queued maintenance task now.
    pub async fn flush_maintenance(&self) {
        self.inner.run_maintenance().await;
    }

    pub fn pending_maintenance(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Inner {
    async fn with_timeout<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, RepoError>>,
    ) -> Result<T, CacheError> {
        run_with_timeout(op, self.config.operation_timeout(), fut).await
    }

    #[instrument(skip(self))]
    async fn run_maintenance(&self) {
        loop {
            let tasks = self.queue.drain(self.config.maintenance_batch_limit.max(1));
            if tasks.is_empty() {
                break;
            }

            let started_at = Instant::now();
            let plan = MaintenancePlan::from_tasks(tasks);
            debug!(%plan, "Applying search cache maintenance");
            self.apply(&plan).await;
            histogram!(METRIC_MAINTENANCE_MS)
                .record(started_at.elapsed().as_secs_f64() * 1000.0);
        }
    }

    async fn apply(&self, plan: &MaintenancePlan) {
        let limit = self.config.maintenance_timeout();
        for (hash, by) in &plan.hit_increments {
            let result = run_with_timeout(
                "increment_hit_count",
                limit,
                self.repo.increment_hit_count(hash, *by),
            )
            .await;
            if let Err(err) = result {
                warn!(search_hash = %hash, error = %err, "Dropped search cache hit increment");
            }
        }

        if plan.enforce_capacity
            && let Err(err) = self.enforce_capacity(limit).await
        {
            warn!(error = %err, "Search cache capacity sweep failed");
        }
    }

    async fn enforce_capacity(&self, limit: StdDuration) -> Result<(), CacheError> {
        let max = self.config.persistent_max_entries;
        let count = run_with_timeout("count_entries", limit, self.repo.count_entries()).await?;
        if count <= max {
            return Ok(());
        }

        let deleted = run_with_timeout(
            "delete_oldest",
            limit,
            self.repo.delete_oldest(count - max),
        )
        .await?;
        info!(count, max, deleted, "Trimmed search cache to its row cap");
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<u64, CacheError> {
        let deleted = self
            .with_timeout(
                "delete_expired",
                self.repo.delete_expired(OffsetDateTime::now_utc()),
            )
            .await?;
        if deleted > 0 {
            info!(deleted, "Removed expired search cache rows");
        }
        Ok(deleted)
    }
}

async fn run_with_timeout<T>(
    op: &'static str,
    limit: StdDuration,
    fut: impl Future<Output = Result<T, RepoError>>,
) -> Result<T, CacheError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CacheError::from),
        Err(_) => Err(CacheError::Timeout(op)),
    }
}

// ============================================================================
// Tier strategy
// ============================================================================

/// The persistent tier as chosen by configuration.
#[derive(Clone)]
pub enum SearchTier {
    Database(Arc<PersistentStore>),
    /// Reads miss, writes succeed without storing, stats are empty.
    Disabled,
}

impl SearchTier {
    pub fn is_enabled(&self) -> bool {
        matches!(self, SearchTier::Database(_))
    }

    pub fn store(&self) -> Option<&Arc<PersistentStore>> {
        match self {
            SearchTier::Database(store) => Some(store),
            SearchTier::Disabled => None,
        }
    }

    pub async fn get_cached_search(
        &self,
        params: &QueryParams,
    ) -> Result<Option<SearchCacheRow>, CacheError> {
        match self {
            SearchTier::Database(store) => store.get_cached_search(params).await,
            SearchTier::Disabled => Ok(None),
        }
    }

    pub async fn set_cached_search(
        &self,
        params: &QueryParams,
        result_ids: &[String],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        match self {
            SearchTier::Database(store) => store.set_cached_search(params, result_ids, ttl).await,
            SearchTier::Disabled => Ok(()),
        }
    }

    pub async fn invalidate_search_cache(
        &self,
        patterns: &[KeyPattern],
    ) -> Result<u64, CacheError> {
        match self {
            SearchTier::Database(store) => store.invalidate_search_cache(patterns).await,
            SearchTier::Disabled => Ok(0),
        }
    }

    pub async fn cleanup_expired_entries(&self) -> Result<u64, CacheError> {
        match self {
            SearchTier::Database(store) => store.cleanup_expired_entries().await,
            SearchTier::Disabled => Ok(0),
        }
    }

    pub async fn get_cache_stats(&self) -> Result<SearchCacheStats, CacheError> {
        match self {
            SearchTier::Database(store) => store.get_cache_stats().await,
            SearchTier::Disabled => Ok(SearchCacheStats::default()),
        }
    }

    pub async fn get_optimization_suggestions(
        &self,
    ) -> Result<Vec<OptimizationSuggestion>, CacheError> {
        match self {
            SearchTier::Database(store) => store.get_optimization_suggestions().await,
            SearchTier::Disabled => Ok(Vec::new()),
        }
    }

    pub async fn shutdown(&self) {
        if let SearchTier::Database(store) = self {
            store.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::application::repos::CacheComposition;

    /// Repository that fails every call, optionally after a delay.
    struct FailingRepo {
        delay: StdDuration,
        calls: AtomicU64,
    }

    impl FailingRepo {
        fn new(delay: StdDuration) -> Self {
            Self {
                delay,
                calls: AtomicU64::new(0),
            }
        }

        async fn fail<T>(&self) -> Result<T, RepoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Err(RepoError::from_persistence("connection refused"))
        }
    }

    #[async_trait]
    impl SearchCacheRepo for FailingRepo {
        async fn find_live(
            &self,
            _search_hash: &str,
            _now: OffsetDateTime,
        ) -> Result<Option<SearchCacheRow>, RepoError> {
            self.fail().await
        }

        async fn upsert(&self, _row: &SearchCacheUpsert) -> Result<(), RepoError> {
            self.fail().await
        }

        async fn increment_hit_count(
            &self,
            _search_hash: &str,
            _by: u64,
        ) -> Result<(), RepoError> {
            self.fail().await
        }

        async fn count_entries(&self) -> Result<u64, RepoError> {
            self.fail().await
        }

        async fn delete_oldest(&self, _count: u64) -> Result<u64, RepoError> {
            self.fail().await
        }

        async fn delete_expired(&self, _now: OffsetDateTime) -> Result<u64, RepoError> {
            self.fail().await
        }

        async fn delete_matching(&self, _pattern: &KeyPattern) -> Result<u64, RepoError> {
            self.fail().await
        }

        async fn composition(&self, _now: OffsetDateTime) -> Result<CacheComposition, RepoError> {
            self.fail().await
        }

        async fn top_by_hits(
            &self,
            _now: OffsetDateTime,
            _limit: u32,
        ) -> Result<Vec<SearchCacheRow>, RepoError> {
            self.fail().await
        }

        async fn expiration_window(
            &self,
            _now: OffsetDateTime,
        ) -> Result<ExpirationWindow, RepoError> {
            self.fail().await
        }
    }

    fn params() -> QueryParams {
        QueryParams::new().with("content", "rust")
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_cache_error() {
        let store = PersistentStore::new(
            Arc::new(FailingRepo::new(StdDuration::ZERO)),
            CacheConfig::default(),
        );

        let err = store.get_cached_search(&params()).await.unwrap_err();
        assert_eq!(err.kind(), "backend");
        assert_eq!(store.pending_maintenance(), 0, "no hit queued on failure");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let config = CacheConfig {
            operation_timeout_ms: 50,
            ..Default::default()
        };
        let repo = Arc::new(FailingRepo::new(StdDuration::from_secs(5)));
        let store = PersistentStore::new(repo, config);

        let err = store
            .set_cached_search(&params(), &["c1".to_string()], Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout("upsert")));
    }

    #[tokio::test]
    async fn failed_maintenance_is_swallowed() {
        let repo = Arc::new(FailingRepo::new(StdDuration::ZERO));
        let store = PersistentStore::new(repo.clone(), CacheConfig::default());

        store.update_hit_count("abc");
        store.update_hit_count("abc");
        store.flush_maintenance().await;

        assert_eq!(store.pending_maintenance(), 0);
        assert_eq!(repo.calls.load(Ordering::SeqCst), 1, "hits merged per hash");
    }

    #[tokio::test]
    async fn stats_and_suggestions_respect_flags() {
        let config = CacheConfig {
            enable_stats: false,
            enable_optimization: false,
            ..Default::default()
        };
        let repo = Arc::new(FailingRepo::new(StdDuration::ZERO));
        let store = PersistentStore::new(repo, config);

        assert_eq!(store.get_cache_stats().await.unwrap(), SearchCacheStats::default());
        assert!(store.get_optimization_suggestions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_tier_is_a_no_op() {
        let tier = SearchTier::Disabled;

        assert!(tier.get_cached_search(&params()).await.unwrap().is_none());
        tier.set_cached_search(&params(), &[], Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(tier.invalidate_search_cache(&[KeyPattern::All]).await.unwrap(), 0);
        assert_eq!(tier.cleanup_expired_entries().await.unwrap(), 0);
        assert_eq!(tier.get_cache_stats().await.unwrap(), SearchCacheStats::default());
        assert!(tier.get_optimization_suggestions().await.unwrap().is_empty());
    }
}
