//! Shared fixtures: an in-memory chunk service that counts calls, and an
//! in-memory SQLite search cache repository.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chunk_cache::application::chunks::{ChunkService, ServiceError};
use chunk_cache::config::DatabaseSettings;
use chunk_cache::domain::entities::{ChunkRecord, ChunkUpdate, NewChunk};
use chunk_cache::domain::search::{ContentFilters, SearchQuery, SearchResult};
use chunk_cache::domain::types::{TagLogic, TagMatch};
use chunk_cache::infra::db::SqliteSearchCacheRepo;
use time::OffsetDateTime;

#[derive(Default)]
struct State {
    chunks: BTreeMap<String, ChunkRecord>,
    next_id: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    calls: Mutex<HashMap<&'static str, usize>>,
    fail_writes: AtomicBool,
}

/// Chunk service over a map. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryChunkService {
    inner: Arc<Inner>,
}

impl InMemoryChunkService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `op` reached this service.
    pub fn calls(&self, op: &str) -> usize {
        self.inner
            .calls
            .lock()
            .unwrap()
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Insert a chunk directly, bypassing call counting.
    pub fn seed(&self, chunk: NewChunk) -> ChunkRecord {
        self.insert(chunk)
    }

    /// Insert a chunk under a fixed identifier.
    pub fn seed_with_id(&self, chunk_id: &str, chunk: NewChunk) -> ChunkRecord {
        let record = build_record(chunk_id.to_string(), chunk);
        self.inner
            .state
            .lock()
            .unwrap()
            .chunks
            .insert(chunk_id.to_string(), record.clone());
        record
    }

    fn record(&self, op: &'static str) {
        *self.inner.calls.lock().unwrap().entry(op).or_default() += 1;
    }

    fn check_writable(&self) -> Result<(), ServiceError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            Err(ServiceError::unavailable("writes disabled"))
        } else {
            Ok(())
        }
    }

    fn insert(&self, chunk: NewChunk) -> ChunkRecord {
        let mut state = self.inner.state.lock().unwrap();
        state.next_id += 1;
        let chunk_id = format!("chunk-{}", state.next_id);
        let record = build_record(chunk_id.clone(), chunk);
        state.chunks.insert(chunk_id, record.clone());
        record
    }

    fn apply_update(&self, update: ChunkUpdate) -> Result<ChunkRecord, ServiceError> {
        let mut state = self.inner.state.lock().unwrap();
        let record = state
            .chunks
            .get_mut(&update.chunk_id)
            .ok_or_else(|| ServiceError::not_found(update.chunk_id.as_str()))?;

        if let Some(contents) = update.contents {
            record.contents = contents;
        }
        if let Some(page) = update.page {
            record.page = Some(page);
        }
        if let Some(value) = update.is_page {
            record.is_page = value;
        }
        if let Some(value) = update.is_tag {
            record.is_tag = value;
        }
        if let Some(value) = update.is_template {
            record.is_template = value;
        }
        if let Some(value) = update.is_slot {
            record.is_slot = value;
        }
        if let Some(reference) = update.reference {
            record.reference = Some(reference);
        }
        if let Some(metadata) = update.metadata {
            record.metadata = metadata;
        }
        record.last_updated = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    fn filter(&self, predicate: impl Fn(&ChunkRecord) -> bool) -> Vec<ChunkRecord> {
        self.inner
            .state
            .lock()
            .unwrap()
            .chunks
            .values()
            .filter(|chunk| predicate(chunk))
            .cloned()
            .collect()
    }

    fn lookup(&self, chunk_id: &str) -> Option<ChunkRecord> {
        self.inner
            .state
            .lock()
            .unwrap()
            .chunks
            .get(chunk_id)
            .cloned()
    }
}

fn build_record(chunk_id: String, chunk: NewChunk) -> ChunkRecord {
    let now = OffsetDateTime::now_utc();
    ChunkRecord {
        chunk_id,
        contents: chunk.contents,
        parent: chunk.parent,
        page: chunk.page,
        is_page: chunk.is_page,
        is_tag: chunk.is_tag,
        is_template: chunk.is_template,
        is_slot: chunk.is_slot,
        reference: chunk.reference,
        tags: chunk.tags,
        metadata: chunk.metadata,
        created_time: now,
        last_updated: now,
    }
}

fn matches_query(chunk: &ChunkRecord, query: &SearchQuery) -> bool {
    if let Some(content) = query.content.as_deref()
        && !content.is_empty()
        && !chunk.contents.contains(content)
    {
        return false;
    }
    if !query.tags.is_empty() {
        let matched = match query.tag_logic {
            TagLogic::And => query.tags.iter().all(|tag| chunk.tags.contains(tag)),
            TagLogic::Or => query.tags.iter().any(|tag| chunk.tags.contains(tag)),
        };
        if !matched {
            return false;
        }
    }
    let flags = [
        (query.is_page, chunk.is_page),
        (query.is_tag, chunk.is_tag),
        (query.is_template, chunk.is_template),
        (query.is_slot, chunk.is_slot),
    ];
    if flags
        .iter()
        .any(|(wanted, actual)| wanted.is_some_and(|wanted| wanted != *actual))
    {
        return false;
    }
    if query.parent.is_some() && query.parent != chunk.parent {
        return false;
    }
    if query.page.is_some() && query.page != chunk.page {
        return false;
    }
    query
        .metadata
        .iter()
        .all(|(name, value)| chunk.metadata.get(name) == Some(value))
}

#[async_trait]
impl ChunkService for InMemoryChunkService {
    async fn create_chunk(&self, chunk: NewChunk) -> Result<ChunkRecord, ServiceError> {
        self.record("create_chunk");
        self.check_writable()?;
        Ok(self.insert(chunk))
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<ChunkRecord, ServiceError> {
        self.record("get_chunk");
        self.lookup(chunk_id)
            .ok_or_else(|| ServiceError::not_found(chunk_id))
    }

    async fn get_chunks_by_ids(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("get_chunks_by_ids");
        Ok(chunk_ids.iter().filter_map(|id| self.lookup(id)).collect())
    }

    async fn update_chunk(&self, update: ChunkUpdate) -> Result<ChunkRecord, ServiceError> {
        self.record("update_chunk");
        self.check_writable()?;
        self.apply_update(update)
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<(), ServiceError> {
        self.record("delete_chunk");
        self.check_writable()?;
        self.inner
            .state
            .lock()
            .unwrap()
            .chunks
            .remove(chunk_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::not_found(chunk_id))
    }

    async fn batch_create_chunks(
        &self,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("batch_create_chunks");
        self.check_writable()?;
        Ok(chunks.into_iter().map(|chunk| self.insert(chunk)).collect())
    }

    async fn batch_update_chunks(
        &self,
        updates: Vec<ChunkUpdate>,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("batch_update_chunks");
        self.check_writable()?;
        updates
            .into_iter()
            .map(|update| self.apply_update(update))
            .collect()
    }

    async fn add_tags(&self, chunk_id: &str, tag_ids: &[String]) -> Result<(), ServiceError> {
        self.record("add_tags");
        self.check_writable()?;
        let mut state = self.inner.state.lock().unwrap();
        let record = state
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| ServiceError::not_found(chunk_id))?;
        for tag in tag_ids {
            if !record.tags.contains(tag) {
                record.tags.push(tag.clone());
            }
        }
        Ok(())
    }

    async fn remove_tags(&self, chunk_id: &str, tag_ids: &[String]) -> Result<(), ServiceError> {
        self.record("remove_tags");
        self.check_writable()?;
        let mut state = self.inner.state.lock().unwrap();
        let record = state
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| ServiceError::not_found(chunk_id))?;
        record.tags.retain(|tag| !tag_ids.contains(tag));
        Ok(())
    }

    async fn get_chunk_tags(&self, chunk_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("get_chunk_tags");
        let chunk = self
            .lookup(chunk_id)
            .ok_or_else(|| ServiceError::not_found(chunk_id))?;
        Ok(chunk.tags.iter().filter_map(|id| self.lookup(id)).collect())
    }

    async fn get_chunks_by_tag(&self, tag_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("get_chunks_by_tag");
        Ok(self.filter(|chunk| chunk.tags.iter().any(|tag| tag == tag_id)))
    }

    async fn get_chunks_by_tags(
        &self,
        tag_ids: &[String],
        match_type: TagMatch,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("get_chunks_by_tags");
        Ok(self.filter(|chunk| match match_type {
            TagMatch::All => tag_ids.iter().all(|tag| chunk.tags.contains(tag)),
            TagMatch::Any => tag_ids.iter().any(|tag| chunk.tags.contains(tag)),
        }))
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("get_children");
        Ok(self.filter(|chunk| chunk.parent.as_deref() == Some(parent_id)))
    }

    async fn get_descendants(
        &self,
        chunk_id: &str,
        max_depth: u32,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("get_descendants");
        let mut found = Vec::new();
        let mut frontier = vec![chunk_id.to_string()];
        let mut seen = HashSet::new();
        let mut depth = 0;
        while !frontier.is_empty() && (max_depth == 0 || depth < max_depth) {
            let children: Vec<ChunkRecord> = self.filter(|chunk| {
                chunk
                    .parent
                    .as_ref()
                    .is_some_and(|parent| frontier.contains(parent))
            });
            frontier = children
                .iter()
                .filter(|chunk| seen.insert(chunk.chunk_id.clone()))
                .map(|chunk| chunk.chunk_id.clone())
                .collect();
            found.extend(
                children
                    .into_iter()
                    .filter(|chunk| frontier.contains(&chunk.chunk_id)),
            );
            depth += 1;
        }
        Ok(found)
    }

    async fn get_ancestors(&self, chunk_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("get_ancestors");
        let mut ancestors = Vec::new();
        let mut current = self
            .lookup(chunk_id)
            .ok_or_else(|| ServiceError::not_found(chunk_id))?;
        while let Some(parent) = current.parent.clone().and_then(|id| self.lookup(&id)) {
            ancestors.push(parent.clone());
            current = parent;
        }
        Ok(ancestors)
    }

    async fn move_chunk(&self, chunk_id: &str, new_parent_id: &str) -> Result<(), ServiceError> {
        self.record("move_chunk");
        self.check_writable()?;
        let mut state = self.inner.state.lock().unwrap();
        let record = state
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| ServiceError::not_found(chunk_id))?;
        record.parent = Some(new_parent_id.to_string());
        Ok(())
    }

    async fn search_chunks(&self, query: &SearchQuery) -> Result<SearchResult, ServiceError> {
        self.record("search_chunks");
        let matched = self.filter(|chunk| matches_query(chunk, query));
        let total_count = matched.len() as u64;
        let offset = query.offset as usize;
        let limit = if query.limit == 0 {
            usize::MAX
        } else {
            query.limit as usize
        };
        let chunks: Vec<ChunkRecord> = matched.into_iter().skip(offset).take(limit).collect();
        let has_more = (offset + chunks.len()) < total_count as usize;
        Ok(SearchResult {
            chunks,
            total_count,
            has_more,
            search_time_ms: 1,
            cache_hit: false,
        })
    }

    async fn search_by_content(
        &self,
        content: &str,
        filters: &ContentFilters,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.record("search_by_content");
        let query = SearchQuery::for_content(content, filters);
        Ok(self.filter(|chunk| matches_query(chunk, &query)))
    }
}

/// Migrated in-memory SQLite search cache repository.
pub async fn sqlite_repo() -> SqliteSearchCacheRepo {
    let settings = DatabaseSettings {
        url: None,
        max_connections: NonZeroU32::MIN,
        acquire_timeout: Duration::from_secs(5),
    };
    let pool = SqliteSearchCacheRepo::connect(&settings, "sqlite::memory:")
        .await
        .expect("in-memory sqlite should open");
    let repo = SqliteSearchCacheRepo::new(pool);
    repo.run_migrations()
        .await
        .expect("sqlite migrations should apply");
    repo
}

pub fn chunk(contents: &str) -> NewChunk {
    NewChunk {
        contents: contents.to_string(),
        ..Default::default()
    }
}

pub fn child_of(parent: &str, contents: &str) -> NewChunk {
    NewChunk {
        contents: contents.to_string(),
        parent: Some(parent.to_string()),
        ..Default::default()
    }
}

pub fn tagged(contents: &str, tags: &[&str]) -> NewChunk {
    NewChunk {
        contents: contents.to_string(),
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
        ..Default::default()
    }
}
