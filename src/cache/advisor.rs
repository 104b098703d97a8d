//! Rule-based tuning advice for the persistent search tier.
//!
//! Every rule is evaluated on its own; any number may fire. Advice is
//! read-only and never changes cache state.

use serde::Serialize;
use serde_json::{Value, json};

use super::config::CacheConfig;
use super::persistent::SearchCacheStats;

const LOW_HIT_RATE: f64 = 0.5;
const TARGET_HIT_RATE: f64 = 0.7;
const MAX_RECOMMENDED_SIZE_MB: u64 = 50;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationSuggestion {
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: Priority,
    pub description: String,
    pub action: String,
    pub impact: String,
    pub data: Value,
}

/// Evaluate all rules against `stats`, highest priority first.
pub fn suggest(stats: &SearchCacheStats, config: &CacheConfig) -> Vec<OptimizationSuggestion> {
    let mut suggestions = Vec::new();

    if stats.hit_rate < LOW_HIT_RATE {
        suggestions.push(OptimizationSuggestion {
            kind: "hit_rate".to_string(),
            priority: Priority::High,
            description: format!(
                "Only {:.0}% of cached searches are still live",
                stats.hit_rate * 100.0
            ),
            action: "Increase the search cache TTL or review query patterns".to_string(),
            impact: "Fewer searches reach the chunk service".to_string(),
            data: json!({
                "current_hit_rate": stats.hit_rate,
                "target_hit_rate": TARGET_HIT_RATE,
            }),
        });
    }

    if stats.expired_entries.saturating_mul(4) > stats.total_entries {
        suggestions.push(OptimizationSuggestion {
            kind: "expiration".to_string(),
            priority: Priority::Medium,
            description: format!(
                "{} of {} cached searches have expired",
                stats.expired_entries, stats.total_entries
            ),
            action: "Run cleanup more frequently or adjust the TTL".to_string(),
            impact: "Smaller table and faster lookups".to_string(),
            data: json!({
                "expired_entries": stats.expired_entries,
                "total_entries": stats.total_entries,
                "cleanup_interval_secs": config.persistent_cleanup_interval_secs,
            }),
        });
    }

    if stats.cache_size_bytes > config.large_size_threshold_bytes {
        let size_mb = stats.cache_size_bytes as f64 / BYTES_PER_MB;
        suggestions.push(OptimizationSuggestion {
            kind: "size".to_string(),
            priority: Priority::Medium,
            description: format!("Search cache holds an estimated {size_mb:.1} MB"),
            action: "Reduce the TTL or clean up more aggressively".to_string(),
            impact: "Lower storage use".to_string(),
            data: json!({
                "size_mb": size_mb,
                "max_recommended_mb": MAX_RECOMMENDED_SIZE_MB,
            }),
        });
    }

    let low_hit_queries = stats
        .top_queries
        .iter()
        .filter(|query| query.hit_count < config.hit_count_threshold)
        .count();
    if low_hit_queries * 2 > stats.top_queries.len() {
        suggestions.push(OptimizationSuggestion {
            kind: "utilization".to_string(),
            priority: Priority::Low,
            description: format!(
                "{low_hit_queries} of the {} most used searches have fewer than {} hits",
                stats.top_queries.len(),
                config.hit_count_threshold
            ),
            action: "Review underused query patterns".to_string(),
            impact: "Cache space goes to searches that repeat".to_string(),
            data: json!({
                "low_hit_queries": low_hit_queries,
                "sampled_queries": stats.top_queries.len(),
                "hit_count_threshold": config.hit_count_threshold,
            }),
        });
    }

    suggestions.sort_by(|a, b| b.priority.cmp(&a.priority));
    suggestions
}
