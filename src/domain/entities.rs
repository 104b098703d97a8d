//! Chunk records mirrored from the authoritative chunk service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// A content chunk as returned by the authoritative service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub contents: String,
    pub parent: Option<String>,
    pub page: Option<String>,
    pub is_page: bool,
    pub is_tag: bool,
    pub is_template: bool,
    pub is_slot: bool,
    pub reference: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
    pub created_time: OffsetDateTime,
    pub last_updated: OffsetDateTime,
}

/// Input for creating a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewChunk {
    pub contents: String,
    pub parent: Option<String>,
    pub page: Option<String>,
    pub is_page: bool,
    pub is_tag: bool,
    pub is_template: bool,
    pub is_slot: bool,
    pub reference: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
}

/// Partial update for an existing chunk. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkUpdate {
    pub chunk_id: String,
    pub contents: Option<String>,
    pub page: Option<String>,
    pub is_page: Option<bool>,
    pub is_tag: Option<bool>,
    pub is_template: Option<bool>,
    pub is_slot: Option<bool>,
    pub reference: Option<String>,
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl ChunkUpdate {
    pub fn new(chunk_id: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            ..Default::default()
        }
    }
}
