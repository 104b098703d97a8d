//! Chunk query cache
//!
//! Two tiers sit between callers and the chunk service:
//!
//! - **Volatile tier**: in-process key/value store with per-entry TTL,
//!   bounded size and a background expiry sweep. Holds full query results.
//! - **Persistent tier**: database table of search results (identifiers
//!   only) with hit counts, statistics and tuning advice.
//!
//! [`CachedChunkService`] wraps a [`ChunkService`](crate::application::chunks::ChunkService)
//! and routes reads through [`QueryCache`]; successful writes are mapped to
//! an [`InvalidationPlan`] and applied to both tiers.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `chunk-cache.toml`:
//!
//! ```toml
//! [cache]
//! enable_volatile_cache = true
//! enable_persistent_cache = true
//! volatile_max_entries = 1000
//! default_ttl_secs = 300
//! # ... see config.rs for all options
//! ```

mod advisor;
mod config;
mod decorator;
mod error;
mod invalidation;
mod keys;
mod lock;
mod maintenance;
mod orchestrator;
mod persistent;
mod registry;
mod store;
mod task;

pub use advisor::{OptimizationSuggestion, Priority, suggest};
pub use config::{CacheConfig, SearchTtlPolicy, TtlPolicy};
pub use decorator::{CachedChunkService, search_params};
pub use error::CacheError;
pub use invalidation::{InvalidationPlan, Mutation};
pub use keys::{
    CacheKey, Dependency, KEY_NAMESPACE, KEY_VERSION, KeyPattern, ParamValue, QueryParams,
    derive_key, search_hash,
};
pub use maintenance::{MaintenancePlan, MaintenanceQueue, MaintenanceTask};
pub use orchestrator::{
    CacheOutcome, Fetched, InvalidationReport, PersistentLookup, QueryCache, QueryResult,
};
pub use persistent::{PersistentStore, SearchCacheStats, SearchTier, TopQuery};
pub use registry::DependencyRegistry;
pub use store::{VolatileStats, VolatileStore, VolatileTier};
