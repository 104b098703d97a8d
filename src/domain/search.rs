//! Search query and result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entities::ChunkRecord;
use super::types::TagLogic;

/// Default row limit applied by content search when the caller gives none.
pub const DEFAULT_CONTENT_SEARCH_LIMIT: u32 = 1000;

/// Structured chunk search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub content: Option<String>,
    pub tags: Vec<String>,
    pub tag_logic: TagLogic,
    pub is_page: Option<bool>,
    pub is_tag: Option<bool>,
    pub is_template: Option<bool>,
    pub is_slot: Option<bool>,
    pub parent: Option<String>,
    pub page: Option<String>,
    pub metadata: BTreeMap<String, Value>,
    pub limit: u32,
    pub offset: u32,
}

impl SearchQuery {
    /// Content search with the given filters applied.
    pub fn for_content(content: &str, filters: &ContentFilters) -> Self {
        Self {
            content: Some(content.to_string()),
            is_page: filters.is_page,
            is_tag: filters.is_tag,
            is_template: filters.is_template,
            is_slot: filters.is_slot,
            parent: filters.parent.clone(),
            page: filters.page.clone(),
            limit: filters.limit.unwrap_or(DEFAULT_CONTENT_SEARCH_LIMIT),
            offset: filters.offset.unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty())
    }

    pub fn has_type_filter(&self) -> bool {
        self.is_page.is_some()
            || self.is_tag.is_some()
            || self.is_template.is_some()
            || self.is_slot.is_some()
    }
}

/// Optional filters for content search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilters {
    pub is_page: Option<bool>,
    pub is_tag: Option<bool>,
    pub is_template: Option<bool>,
    pub is_slot: Option<bool>,
    pub parent: Option<String>,
    pub page: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunks: Vec<ChunkRecord>,
    pub total_count: u64,
    pub has_more: bool,
    pub search_time_ms: u64,
    /// Set when the result was served from a cache tier.
    pub cache_hit: bool,
}
