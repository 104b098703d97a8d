use thiserror::Error;

use crate::application::repos::RepoError;

/// Failures inside a cache tier.
///
/// None of these reach callers of the cached service: reads degrade to a
/// miss and writes are logged and dropped.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache backend unavailable: {0}")]
    Backend(#[from] RepoError),
    #[error("cache operation `{0}` timed out")]
    Timeout(&'static str),
}

impl CacheError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Serialization(_) => "serialization",
            CacheError::Backend(_) => "backend",
            CacheError::Timeout(_) => "timeout",
        }
    }
}
