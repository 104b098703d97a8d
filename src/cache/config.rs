//! Cache configuration.
//!
//! Controls the volatile (in-process) tier and the persistent search tier via
//! the `[cache]` section of `chunk-cache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration as StdDuration;

use serde::Deserialize;
use time::Duration;

use crate::domain::search::SearchQuery;

// Default values for cache configuration
const DEFAULT_VOLATILE_MAX_ENTRIES: usize = 1000;
const DEFAULT_VOLATILE_CLEANUP_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_TTL_SECS: i64 = 5 * 60;
const DEFAULT_TAG_TTL_SECS: i64 = 10 * 60;
const DEFAULT_HIERARCHY_TTL_SECS: i64 = 15 * 60;
const DEFAULT_SEARCH_TTL_SECS: i64 = 3 * 60;
const DEFAULT_SEARCH_CONTENT_TTL_SECS: i64 = 5 * 60;
const DEFAULT_SEARCH_TAG_TTL_SECS: i64 = 15 * 60;
const DEFAULT_SEARCH_TYPE_TTL_SECS: i64 = 30 * 60;
const DEFAULT_SEARCH_FALLBACK_TTL_SECS: i64 = 10 * 60;
const DEFAULT_PERSISTENT_MAX_ENTRIES: u64 = 50_000;
const DEFAULT_PERSISTENT_CLEANUP_INTERVAL_SECS: u64 = 10 * 60;
const DEFAULT_HIT_COUNT_THRESHOLD: i64 = 5;
const DEFAULT_LARGE_SIZE_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_TOP_QUERIES_LIMIT: u32 = 10;
const DEFAULT_MAINTENANCE_QUEUE_LIMIT: usize = 1024;
const DEFAULT_MAINTENANCE_BATCH_LIMIT: usize = 256;
const DEFAULT_MAINTENANCE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Cache configuration from `chunk-cache.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the in-process volatile tier.
    pub enable_volatile_cache: bool,
    /// Enable the database-backed search tier.
    pub enable_persistent_cache: bool,
    /// Compute persistent-tier statistics.
    pub enable_stats: bool,
    /// Compute optimization suggestions.
    pub enable_optimization: bool,
    /// Maximum live entries in the volatile tier.
    pub volatile_max_entries: usize,
    /// Interval (s) between volatile expiry sweeps.
    pub volatile_cleanup_interval_secs: u64,
    /// TTL (s) for query kinds without a dedicated TTL.
    pub default_ttl_secs: i64,
    /// TTL (s) for tag lookups.
    pub tag_ttl_secs: i64,
    /// TTL (s) for hierarchy traversals.
    pub hierarchy_ttl_secs: i64,
    /// TTL (s) for search results in the volatile tier.
    pub search_ttl_secs: i64,
    /// Persistent TTL (s) for searches with content text.
    pub search_content_ttl_secs: i64,
    /// Persistent TTL (s) for searches filtered by tags.
    pub search_tag_ttl_secs: i64,
    /// Persistent TTL (s) for searches filtered by chunk type flags.
    pub search_type_ttl_secs: i64,
    /// Persistent TTL (s) for any other search.
    pub search_fallback_ttl_secs: i64,
    /// Row cap of the persistent tier.
    pub persistent_max_entries: u64,
    /// Interval (s) between persistent expiry sweeps.
    pub persistent_cleanup_interval_secs: u64,
    /// Hit count under which a top query counts as underused.
    pub hit_count_threshold: i64,
    /// Estimated size above which the advisor flags the table.
    pub large_size_threshold_bytes: u64,
    /// Number of top queries reported by stats.
    pub top_queries_limit: u32,
    /// Capacity of the maintenance queue; extra tasks are dropped.
    pub maintenance_queue_limit: usize,
    /// Maximum tasks merged into one maintenance plan.
    pub maintenance_batch_limit: usize,
    /// Timeout (ms) for each background maintenance statement.
    pub maintenance_timeout_ms: u64,
    /// Timeout (ms) for each persistent-tier statement on the request path.
    pub operation_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_volatile_cache: true,
            enable_persistent_cache: true,
            enable_stats: true,
            enable_optimization: true,
            volatile_max_entries: DEFAULT_VOLATILE_MAX_ENTRIES,
            volatile_cleanup_interval_secs: DEFAULT_VOLATILE_CLEANUP_INTERVAL_SECS,
            default_ttl_secs: DEFAULT_TTL_SECS,
            tag_ttl_secs: DEFAULT_TAG_TTL_SECS,
            hierarchy_ttl_secs: DEFAULT_HIERARCHY_TTL_SECS,
            search_ttl_secs: DEFAULT_SEARCH_TTL_SECS,
            search_content_ttl_secs: DEFAULT_SEARCH_CONTENT_TTL_SECS,
            search_tag_ttl_secs: DEFAULT_SEARCH_TAG_TTL_SECS,
            search_type_ttl_secs: DEFAULT_SEARCH_TYPE_TTL_SECS,
            search_fallback_ttl_secs: DEFAULT_SEARCH_FALLBACK_TTL_SECS,
            persistent_max_entries: DEFAULT_PERSISTENT_MAX_ENTRIES,
            persistent_cleanup_interval_secs: DEFAULT_PERSISTENT_CLEANUP_INTERVAL_SECS,
            hit_count_threshold: DEFAULT_HIT_COUNT_THRESHOLD,
            large_size_threshold_bytes: DEFAULT_LARGE_SIZE_THRESHOLD_BYTES,
            top_queries_limit: DEFAULT_TOP_QUERIES_LIMIT,
            maintenance_queue_limit: DEFAULT_MAINTENANCE_QUEUE_LIMIT,
            maintenance_batch_limit: DEFAULT_MAINTENANCE_BATCH_LIMIT,
            maintenance_timeout_ms: DEFAULT_MAINTENANCE_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    /// Returns the volatile capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn volatile_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.volatile_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn volatile_cleanup_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.volatile_cleanup_interval_secs.max(1))
    }

    pub fn persistent_cleanup_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.persistent_cleanup_interval_secs.max(1))
    }

    pub fn maintenance_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.maintenance_timeout_ms)
    }

    pub fn operation_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.operation_timeout_ms)
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            default: Duration::seconds(self.default_ttl_secs),
            tag: Duration::seconds(self.tag_ttl_secs),
            hierarchy: Duration::seconds(self.hierarchy_ttl_secs),
            search: Duration::seconds(self.search_ttl_secs),
        }
    }

    pub fn search_ttl_policy(&self) -> SearchTtlPolicy {
        SearchTtlPolicy {
            content: Duration::seconds(self.search_content_ttl_secs),
            tags: Duration::seconds(self.search_tag_ttl_secs),
            type_filter: Duration::seconds(self.search_type_ttl_secs),
            fallback: Duration::seconds(self.search_fallback_ttl_secs),
        }
    }
}

/// Volatile-tier TTL chosen from the query kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub default: Duration,
    pub tag: Duration,
    pub hierarchy: Duration,
    pub search: Duration,
}

impl TtlPolicy {
    /// Kinds containing `tag` win over hierarchy and search markers.
    pub fn ttl_for(&self, kind: &str) -> Duration {
        if kind.contains("tag") {
            self.tag
        } else if ["hierarchy", "children", "ancestors", "descendants"]
            .iter()
            .any(|marker| kind.contains(marker))
        {
            self.hierarchy
        } else if kind.contains("search") {
            self.search
        } else {
            self.default
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        CacheConfig::default().ttl_policy()
    }
}

/// Persistent-tier TTL chosen from the shape of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchTtlPolicy {
    pub content: Duration,
    pub tags: Duration,
    pub type_filter: Duration,
    pub fallback: Duration,
}

impl SearchTtlPolicy {
    pub fn ttl_for(&self, query: &SearchQuery) -> Duration {
        if query.has_content() {
            self.content
        } else if !query.tags.is_empty() {
            self.tags
        } else if query.has_type_filter() {
            self.type_filter
        } else {
            self.fallback
        }
    }
}
