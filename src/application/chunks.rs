//! Contract of the authoritative chunk service.
//!
//! The cache layer only ever talks to the source through this trait. The
//! caching decorator implements it as well, so callers cannot tell a cached
//! service from the real one.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{ChunkRecord, ChunkUpdate, NewChunk};
use crate::domain::search::{ContentFilters, SearchQuery, SearchResult};
use crate::domain::types::TagMatch;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("chunk `{0}` not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("chunk service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

#[async_trait]
pub trait ChunkService: Send + Sync {
    async fn create_chunk(&self, chunk: NewChunk) -> Result<ChunkRecord, ServiceError>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<ChunkRecord, ServiceError>;

    /// Chunks for the given identifiers, in the order given. Unknown ids are skipped.
    async fn get_chunks_by_ids(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn update_chunk(&self, update: ChunkUpdate) -> Result<ChunkRecord, ServiceError>;

    async fn delete_chunk(&self, chunk_id: &str) -> Result<(), ServiceError>;

    async fn batch_create_chunks(
        &self,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn batch_update_chunks(
        &self,
        updates: Vec<ChunkUpdate>,
    ) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn add_tags(&self, chunk_id: &str, tag_ids: &[String]) -> Result<(), ServiceError>;

    async fn remove_tags(&self, chunk_id: &str, tag_ids: &[String]) -> Result<(), ServiceError>;

    async fn get_chunk_tags(&self, chunk_id: &str) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn get_chunks_by_tag(&self, tag_id: &str) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn get_chunks_by_tags(
        &self,
        tag_ids: &[String],
        match_type: TagMatch,
    ) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn get_children(&self, parent_id: &str) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn get_descendants(
        &self,
        chunk_id: &str,
        max_depth: u32,
    ) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn get_ancestors(&self, chunk_id: &str) -> Result<Vec<ChunkRecord>, ServiceError>;

    async fn move_chunk(&self, chunk_id: &str, new_parent_id: &str) -> Result<(), ServiceError>;

    async fn search_chunks(&self, query: &SearchQuery) -> Result<SearchResult, ServiceError>;

    async fn search_by_content(
        &self,
        content: &str,
        filters: &ContentFilters,
    ) -> Result<Vec<ChunkRecord>, ServiceError>;
}
