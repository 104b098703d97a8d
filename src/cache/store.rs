//! Volatile (in-process) query cache.
//!
//! Entries hold the serialized result, so a hit always hands the caller a
//! fresh copy. Expiry is checked lazily on every read and eagerly by a
//! janitor task. When a new key arrives at capacity, exactly one entry is
//! evicted: the one created first (FIFO by creation, not LRU).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration as StdDuration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::{Duration, OffsetDateTime};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::{Dependency, KeyPattern};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::registry::DependencyRegistry;
use super::task::BackgroundTask;

const SOURCE: &str = "cache::store";

const METRIC_L1_HIT: &str = "chunk_cache_l1_hit_total";
const METRIC_L1_MISS: &str = "chunk_cache_l1_miss_total";
const METRIC_L1_EVICT: &str = "chunk_cache_l1_evict_total";
const METRIC_L1_EXPIRED: &str = "chunk_cache_l1_expired_total";

/// Upper bound for entry lifetimes so `Instant` arithmetic cannot overflow.
const MAX_TTL: StdDuration = StdDuration::from_secs(10 * 365 * 24 * 60 * 60);

// ============================================================================
// Entries and stats
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
    /// Creation order; lower is older.
    seq: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct StoreState {
    entries: HashMap<String, Entry>,
    by_age: BTreeMap<u64, String>,
    registry: DependencyRegistry,
    next_seq: u64,
    last_cleared: OffsetDateTime,
}

impl StoreState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_age: BTreeMap::new(),
            registry: DependencyRegistry::new(),
            next_seq: 0,
            last_cleared: OffsetDateTime::now_utc(),
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.by_age.remove(&entry.seq);
                self.registry.unregister(key);
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.by_age.pop_first()?;
        self.entries.remove(&key);
        self.registry.unregister(&key);
        Some(key)
    }

    fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.by_age.clear();
        self.registry.clear();
        self.last_cleared = OffsetDateTime::now_utc();
        removed
    }
}

/// Point-in-time counters of the volatile tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolatileStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    pub evictions: u64,
    pub last_cleared: Option<OffsetDateTime>,
}

impl VolatileStats {
    /// Stats reported by a disabled tier.
    pub fn empty() -> Self {
        Self {
            hits: 0,
            misses: 0,
            hit_rate: 0.0,
            size: 0,
            max_size: 0,
            evictions: 0,
            last_cleared: None,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct VolatileStore {
    state: RwLock<StoreState>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    janitor: Mutex<Option<BackgroundTask>>,
}

impl VolatileStore {
    /// Create a store without a janitor. Expired entries are still never served.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.volatile_max_entries_non_zero().get())
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            janitor: Mutex::new(None),
        }
    }

    /// Create a store and start its janitor on the current runtime.
    pub fn start(config: &CacheConfig) -> Arc<Self> {
        let store = Arc::new(Self::new(config));
        store.spawn_janitor(config.volatile_cleanup_interval());
        store
    }

    /// Start the periodic expiry sweep. Replaces a janitor started earlier.
    pub fn spawn_janitor(self: &Arc<Self>, interval: StdDuration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = BackgroundTask::spawn("volatile_janitor", move |token| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else { break };
                        store.purge_expired();
                    }
                }
            }
        });

        let previous = mutex_lock(&self.janitor, SOURCE, "spawn_janitor").replace(task);
        drop(previous);
    }

    /// Stop the janitor and wait for it to finish.
    pub async fn shutdown(&self) {
        let task = mutex_lock(&self.janitor, SOURCE, "shutdown").take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    /// Decode the live entry under `key`. An entry that fails to decode is
    /// dropped and counted as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(bytes) = self.get_bytes(key) else {
            self.record_miss();
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.record_hit();
                Ok(Some(value))
            }
            Err(err) => {
                self.record_miss();
                let mut state = rw_write(&self.state, SOURCE, "get.undecodable");
                if state.entries.get(key).is_some_and(|entry| entry.value == bytes) {
                    state.remove(key);
                }
                drop(state);
                Err(err.into())
            }
        }
    }

    fn get_bytes(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let lookup = rw_read(&self.state, SOURCE, "get")
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => return Some(value),
            Some(None) => {
                let mut state = rw_write(&self.state, SOURCE, "get.expire");
                // The entry may have been replaced since the read lock was released.
                if state
                    .entries
                    .get(key)
                    .is_some_and(|entry| entry.is_expired(now))
                {
                    state.remove(key);
                    counter!(METRIC_L1_EXPIRED).increment(1);
                }
            }
            None => {}
        }
        None
    }

    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.set_with_dependencies(key, value, ttl, HashSet::new())
    }

    /// Store `value` and register it against `dependencies` for targeted invalidation.
    pub fn set_with_dependencies<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        dependencies: HashSet<Dependency>,
    ) -> Result<(), CacheError> {
        let value = Bytes::from(serde_json::to_vec(value)?);
        let now = Instant::now();
        let expires_at = expiry_for(now, ttl);

        let mut state = rw_write(&self.state, SOURCE, "set");
        let evicted = if state.entries.contains_key(key) {
            state.remove(key);
            None
        } else if state.entries.len() >= self.max_entries {
            state.evict_oldest()
        } else {
            None
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
        state.by_age.insert(seq, key.to_string());
        state.registry.register(key, dependencies);
        drop(state);

        if let Some(evicted) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_L1_EVICT).increment(1);
            debug!(evicted_key = %evicted, "Evicted oldest volatile cache entry");
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> bool {
        rw_write(&self.state, SOURCE, "delete").remove(key)
    }

    /// Delete every key matching `pattern`. Returns the number removed.
    pub fn delete_pattern(&self, pattern: &KeyPattern) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "delete_pattern");
        let removed = match pattern {
            KeyPattern::All => state.clear(),
            KeyPattern::Exact(key) => usize::from(state.remove(key)),
            KeyPattern::Prefix(_) => {
                let matching: Vec<String> = state
                    .entries
                    .keys()
                    .filter(|key| pattern.matches(key))
                    .cloned()
                    .collect();
                for key in &matching {
                    state.remove(key);
                }
                matching.len()
            }
        };
        drop(state);

        debug!(%pattern, removed, "Deleted volatile cache entries by pattern");
        removed
    }

    /// Delete every entry registered against any of `dependencies`.
    pub fn delete_dependents(&self, dependencies: &HashSet<Dependency>) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "delete_dependents");
        let keys = state.registry.dependents(dependencies);
        let removed = keys.iter().filter(|key| state.remove(key)).count();
        drop(state);

        debug!(
            dependencies = dependencies.len(),
            removed, "Deleted volatile cache entries by dependency"
        );
        removed
    }

    pub fn clear(&self) {
        let removed = rw_write(&self.state, SOURCE, "clear").clear();
        info!(removed, "Cleared volatile cache");
    }

    /// Remove all expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = rw_write(&self.state, SOURCE, "purge_expired");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        drop(state);

        if !expired.is_empty() {
            counter!(METRIC_L1_EXPIRED).increment(expired.len() as u64);
            debug!(removed = expired.len(), "Volatile cache sweep removed expired entries");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> VolatileStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let state = rw_read(&self.state, SOURCE, "stats");
        VolatileStats {
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            size: state.entries.len(),
            max_size: self.max_entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            last_cleared: Some(state.last_cleared),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_L1_HIT).increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_L1_MISS).increment(1);
    }
}

fn expiry_for(now: Instant, ttl: Duration) -> Instant {
    if !ttl.is_positive() {
        return now;
    }
    let ttl = ttl.unsigned_abs().min(MAX_TTL);
    now + ttl
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// ============================================================================
// Tier strategy
// ============================================================================

/// The volatile tier as chosen by configuration.
#[derive(Clone)]
pub enum VolatileTier {
    Memory(Arc<VolatileStore>),
    /// Reads miss, writes succeed without storing, stats are empty.
    Disabled,
}

impl VolatileTier {
    /// Build the tier from configuration, starting the janitor when enabled.
    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enable_volatile_cache {
            VolatileTier::Memory(VolatileStore::start(config))
        } else {
            VolatileTier::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, VolatileTier::Memory(_))
    }

    pub fn store(&self) -> Option<&Arc<VolatileStore>> {
        match self {
            VolatileTier::Memory(store) => Some(store),
            VolatileTier::Disabled => None,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self {
            VolatileTier::Memory(store) => store.get(key),
            VolatileTier::Disabled => Ok(None),
        }
    }

    pub fn set_with_dependencies<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        dependencies: HashSet<Dependency>,
    ) -> Result<(), CacheError> {
        match self {
            VolatileTier::Memory(store) => {
                store.set_with_dependencies(key, value, ttl, dependencies)
            }
            VolatileTier::Disabled => Ok(()),
        }
    }

    pub fn delete_pattern(&self, pattern: &KeyPattern) -> usize {
        match self {
            VolatileTier::Memory(store) => store.delete_pattern(pattern),
            VolatileTier::Disabled => 0,
        }
    }

    pub fn delete_dependents(&self, dependencies: &HashSet<Dependency>) -> usize {
        match self {
            VolatileTier::Memory(store) => store.delete_dependents(dependencies),
            VolatileTier::Disabled => 0,
        }
    }

    pub fn stats(&self) -> VolatileStats {
        match self {
            VolatileTier::Memory(store) => store.stats(),
            VolatileTier::Disabled => VolatileStats::empty(),
        }
    }

    pub async fn shutdown(&self) {
        if let VolatileTier::Memory(store) = self {
            store.shutdown().await;
        }
    }
}
