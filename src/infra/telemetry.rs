use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Runs once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "chunk_cache_query_total",
            Unit::Count,
            "Cached queries by kind and outcome (hit, persistent_hit, miss, error)."
        );
        describe_counter!(
            "chunk_cache_l1_hit_total",
            Unit::Count,
            "Total number of volatile-tier hits."
        );
        describe_counter!(
            "chunk_cache_l1_miss_total",
            Unit::Count,
            "Total number of volatile-tier misses."
        );
        describe_counter!(
            "chunk_cache_l1_evict_total",
            Unit::Count,
            "Total number of volatile-tier evictions due to capacity."
        );
        describe_counter!(
            "chunk_cache_l1_expired_total",
            Unit::Count,
            "Total number of volatile-tier entries removed after their TTL."
        );
        describe_counter!(
            "chunk_cache_read_error_total",
            Unit::Count,
            "Cache tier reads that failed and were treated as misses."
        );
        describe_counter!(
            "chunk_cache_set_error_total",
            Unit::Count,
            "Cache tier writes and invalidations that failed and were dropped."
        );
        describe_counter!(
            "chunk_cache_invalidation_total",
            Unit::Count,
            "Invalidations applied, by tier."
        );
        describe_counter!(
            "chunk_cache_maintenance_dropped_total",
            Unit::Count,
            "Maintenance tasks dropped due to queue overflow."
        );
        describe_gauge!(
            "chunk_cache_maintenance_queue_len",
            Unit::Count,
            "Current number of pending maintenance tasks."
        );
        describe_histogram!(
            "chunk_cache_query_ms",
            Unit::Milliseconds,
            "Latency of queries run against the chunk service on a miss."
        );
        describe_histogram!(
            "chunk_cache_result_size",
            Unit::Count,
            "Number of records returned by queries run on a miss."
        );
        describe_histogram!(
            "chunk_cache_maintenance_ms",
            Unit::Milliseconds,
            "Maintenance batch latency in milliseconds."
        );
    });
}
