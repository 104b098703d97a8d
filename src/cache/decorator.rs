//! Caching wrapper around a chunk service.
//!
//! `CachedChunkService` implements [`ChunkService`] itself. Reads go through
//! the [`QueryCache`]; writes are forwarded unchanged and, only when they
//! succeed, the matching [`InvalidationPlan`] is applied to both tiers.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::application::chunks::{ChunkService, ServiceError};
use crate::application::repos::{SearchCacheRepo, SearchCacheRow};
use crate::domain::entities::{ChunkRecord, ChunkUpdate, NewChunk};
use crate::domain::search::{ContentFilters, SearchQuery, SearchResult};
use crate::domain::types::TagMatch;

use super::config::{CacheConfig, SearchTtlPolicy};
use super::invalidation::{InvalidationPlan, Mutation};
use super::keys::{Dependency, QueryParams};
use super::orchestrator::{PersistentLookup, QueryCache};

const KIND_GET_CHUNK: &str = "get_chunk";
const KIND_CHUNK_TAGS: &str = "get_chunk_tags";
const KIND_BY_TAG: &str = "get_chunks_by_tag";
const KIND_BY_TAGS: &str = "get_chunks_by_tags";
const KIND_CHILDREN: &str = "get_children";
const KIND_DESCENDANTS: &str = "get_descendants";
const KIND_ANCESTORS: &str = "get_ancestors";
const KIND_SEARCH: &str = "search_chunks";

pub struct CachedChunkService<S> {
    inner: S,
    cache: QueryCache,
    search_ttl: SearchTtlPolicy,
}

impl<S: ChunkService> CachedChunkService<S> {
    pub fn new(inner: S, cache: QueryCache, search_ttl: SearchTtlPolicy) -> Self {
        Self {
            inner,
            cache,
            search_ttl,
        }
    }

    /// Wrap `inner` with tiers built from `config`.
    pub fn from_config(
        inner: S,
        config: &CacheConfig,
        repo: Option<Arc<dyn SearchCacheRepo>>,
    ) -> Self {
        Self::new(
            inner,
            QueryCache::from_config(config, repo),
            config.search_ttl_policy(),
        )
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn read_chunks(
        &self,
        kind: &str,
        identifier: &str,
        params: QueryParams,
        dependencies: HashSet<Dependency>,
        query: impl Future<Output = Result<Vec<ChunkRecord>, ServiceError>>,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let key = self.cache.generate_cache_key(kind, identifier, &params);
        self.cache
            .execute_tracked(key.as_ref(), kind, dependencies, || query)
            .await
            .map(|fetched| fetched.value)
    }

    async fn invalidate(&self, mutation: Mutation) {
        let plan = InvalidationPlan::for_mutation(&mutation);
        debug!(%plan, "Applying cache invalidation");
        self.cache.invalidate(&plan).await;
    }

    async fn rebuild_search(
        &self,
        query: &SearchQuery,
        row: SearchCacheRow,
    ) -> Result<SearchResult, ServiceError> {
        let chunks = self.inner.get_chunks_by_ids(&row.result_ids).await?;
        let has_more = query.limit > 0 && chunks.len() >= query.limit as usize;
        Ok(SearchResult {
            total_count: u64::try_from(row.result_count).unwrap_or_default(),
            has_more,
            search_time_ms: 0,
            cache_hit: true,
            chunks,
        })
    }
}

#[async_trait]
impl<S: ChunkService> ChunkService for CachedChunkService<S> {
    async fn create_chunk(&self, chunk: NewChunk) -> Result<ChunkRecord, ServiceError> {
        let created = self.inner.create_chunk(chunk).await?;
        self.invalidate(Mutation::Create).await;
        Ok(created)
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<ChunkRecord, ServiceError> {
        let params = QueryParams::new().with("chunk_id", chunk_id);
        let key = self
            .cache
            .generate_cache_key(KIND_GET_CHUNK, chunk_id, &params);
        let dependencies = chunk_dependency(chunk_id);
        self.cache
            .execute_tracked(key.as_ref(), KIND_GET_CHUNK, dependencies, || {
                self.inner.get_chunk(chunk_id)
            })
            .await
            .map(|fetched| fetched.value)
    }

    async fn get_chunks_by_ids(
        &self,
        chunk_ids: &[String],
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.inner.get_chunks_by_ids(chunk_ids).await
    }

    async fn update_chunk(&self, update: ChunkUpdate) -> Result<ChunkRecord, ServiceError> {
        let chunk_id = update.chunk_id.clone();
        let updated = self.inner.update_chunk(update).await?;
        self.invalidate(Mutation::Update { chunk_id }).await;
        Ok(updated)
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<(), ServiceError> {
        self.inner.delete_chunk(chunk_id).await?;
        self.invalidate(Mutation::Delete {
            chunk_id: chunk_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn batch_create_chunks(
        &self,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let created = self.inner.batch_create_chunks(chunks).await?;
        self.invalidate(Mutation::BatchCreate).await;
        Ok(created)
    }

    async fn batch_update_chunks(
        &self,
        updates: Vec<ChunkUpdate>,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let updated = self.inner.batch_update_chunks(updates).await?;
        self.invalidate(Mutation::BatchUpdate).await;
        Ok(updated)
    }

    async fn add_tags(&self, chunk_id: &str, tag_ids: &[String]) -> Result<(), ServiceError> {
        self.inner.add_tags(chunk_id, tag_ids).await?;
        self.invalidate(Mutation::AddTags {
            chunk_id: chunk_id.to_string(),
            tags: tag_ids.to_vec(),
        })
        .await;
        Ok(())
    }

    async fn remove_tags(&self, chunk_id: &str, tag_ids: &[String]) -> Result<(), ServiceError> {
        self.inner.remove_tags(chunk_id, tag_ids).await?;
        self.invalidate(Mutation::RemoveTags {
            chunk_id: chunk_id.to_string(),
            tags: tag_ids.to_vec(),
        })
        .await;
        Ok(())
    }

    async fn get_chunk_tags(&self, chunk_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.read_chunks(
            KIND_CHUNK_TAGS,
            chunk_id,
            QueryParams::new().with("chunk_id", chunk_id),
            chunk_dependency(chunk_id),
            self.inner.get_chunk_tags(chunk_id),
        )
        .await
    }

    async fn get_chunks_by_tag(&self, tag_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.read_chunks(
            KIND_BY_TAG,
            tag_id,
            QueryParams::new().with("tag_id", tag_id),
            HashSet::from([Dependency::Tag(tag_id.to_string())]),
            self.inner.get_chunks_by_tag(tag_id),
        )
        .await
    }

    async fn get_chunks_by_tags(
        &self,
        tag_ids: &[String],
        match_type: TagMatch,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let tags: Vec<String> = tag_ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let dependencies = tags.iter().cloned().map(Dependency::Tag).collect();
        let params = QueryParams::new()
            .with("tags", tags)
            .with("match", match_type.as_str());
        self.read_chunks(
            KIND_BY_TAGS,
            "",
            params,
            dependencies,
            self.inner.get_chunks_by_tags(tag_ids, match_type),
        )
        .await
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.read_chunks(
            KIND_CHILDREN,
            parent_id,
            QueryParams::new().with("parent_id", parent_id),
            hierarchy_dependencies(parent_id, true),
            self.inner.get_children(parent_id),
        )
        .await
    }

    async fn get_descendants(
        &self,
        chunk_id: &str,
        max_depth: u32,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let params = QueryParams::new()
            .with("chunk_id", chunk_id)
            .with("max_depth", max_depth);
        self.read_chunks(
            KIND_DESCENDANTS,
            chunk_id,
            params,
            hierarchy_dependencies(chunk_id, true),
            self.inner.get_descendants(chunk_id, max_depth),
        )
        .await
    }

    async fn get_ancestors(&self, chunk_id: &str) -> Result<Vec<ChunkRecord>, ServiceError> {
        self.read_chunks(
            KIND_ANCESTORS,
            chunk_id,
            QueryParams::new().with("chunk_id", chunk_id),
            hierarchy_dependencies(chunk_id, false),
            self.inner.get_ancestors(chunk_id),
        )
        .await
    }

    async fn move_chunk(&self, chunk_id: &str, new_parent_id: &str) -> Result<(), ServiceError> {
        self.inner.move_chunk(chunk_id, new_parent_id).await?;
        self.invalidate(Mutation::Move {
            chunk_id: chunk_id.to_string(),
            new_parent: new_parent_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn search_chunks(&self, query: &SearchQuery) -> Result<SearchResult, ServiceError> {
        let params = search_params(query);
        let key = self.cache.generate_cache_key(KIND_SEARCH, "", &params);
        let lookup = PersistentLookup {
            params: &params,
            ttl: self.search_ttl.ttl_for(query),
        };

        let fetched = self
            .cache
            .execute_search_with_cache(
                key.as_ref(),
                KIND_SEARCH,
                lookup,
                HashSet::from([Dependency::Search]),
                || self.inner.search_chunks(query),
                |row| self.rebuild_search(query, row),
            )
            .await?;

        let mut result = fetched.value;
        result.cache_hit = fetched.outcome.is_cached();
        Ok(result)
    }

    async fn search_by_content(
        &self,
        content: &str,
        filters: &ContentFilters,
    ) -> Result<Vec<ChunkRecord>, ServiceError> {
        let query = SearchQuery::for_content(content, filters);
        self.search_chunks(&query).await.map(|result| result.chunks)
    }
}

fn chunk_dependency(chunk_id: &str) -> HashSet<Dependency> {
    HashSet::from([Dependency::Chunk(chunk_id.to_string())])
}

fn hierarchy_dependencies(chunk_id: &str, as_parent: bool) -> HashSet<Dependency> {
    let mut dependencies = HashSet::from([
        Dependency::Hierarchy,
        Dependency::Chunk(chunk_id.to_string()),
    ]);
    if as_parent {
        dependencies.insert(Dependency::Parent(chunk_id.to_string()));
    }
    dependencies
}

/// Parameter bag for a search with empty fields left out.
pub fn search_params(query: &SearchQuery) -> QueryParams {
    let mut params = QueryParams::new()
        .with_opt(
            "content",
            query.content.as_deref().filter(|content| !content.is_empty()),
        )
        .with_opt("is_page", query.is_page)
        .with_opt("is_tag", query.is_tag)
        .with_opt("is_template", query.is_template)
        .with_opt("is_slot", query.is_slot)
        .with_opt("parent", query.parent.as_deref())
        .with_opt("page", query.page.as_deref());

    if !query.tags.is_empty() {
        let tags: BTreeSet<&String> = query.tags.iter().collect();
        params.insert(
            "tags",
            tags.into_iter().cloned().collect::<Vec<String>>(),
        );
        params.insert("tag_logic", query.tag_logic.as_str());
    }
    if !query.metadata.is_empty() {
        let metadata: serde_json::Map<String, Value> = query
            .metadata
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        params.insert("metadata", Value::Object(metadata));
    }
    if query.limit > 0 {
        params.insert("limit", query.limit);
    }
    if query.offset > 0 {
        params.insert("offset", query.offset);
    }
    params
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::cache::keys::{ParamValue, search_hash};
    use crate::domain::types::TagLogic;

    #[test]
    fn search_params_skip_empty_fields() {
        let params = search_params(&SearchQuery::default());
        assert!(params.is_empty());

        let params = search_params(&SearchQuery {
            content: Some(String::new()),
            tag_logic: TagLogic::Or,
            ..Default::default()
        });
        assert!(params.is_empty());
    }

    #[test]
    fn search_params_capture_filters() {
        let query = SearchQuery {
            content: Some("rust".to_string()),
            tags: vec!["b".to_string(), "a".to_string(), "b".to_string()],
            tag_logic: TagLogic::Or,
            is_page: Some(false),
            metadata: BTreeMap::from([("lang".to_string(), json!("en"))]),
            limit: 20,
            ..Default::default()
        };
        let params = search_params(&query);

        assert_eq!(params.get("content"), Some(&ParamValue::from("rust")));
        assert_eq!(
            params.get("tags"),
            Some(&ParamValue::from(vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(params.get("tag_logic"), Some(&ParamValue::from("or")));
        assert_eq!(params.get("is_page"), Some(&ParamValue::from(false)));
        assert_eq!(params.get("limit"), Some(&ParamValue::from(20u32)));
        assert!(params.get("offset").is_none());
        assert!(params.get("metadata").is_some());
    }

    #[test]
    fn tag_order_does_not_change_search_hash() {
        let forward = SearchQuery {
            tags: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        let backward = SearchQuery {
            tags: vec!["b".to_string(), "a".to_string()],
            ..Default::default()
        };
        assert_eq!(
            search_hash(&search_params(&forward)).unwrap(),
            search_hash(&search_params(&backward)).unwrap()
        );
    }

    #[test]
    fn hierarchy_reads_depend_on_parent_only_when_listing_below() {
        assert!(hierarchy_dependencies("p", true).contains(&Dependency::Parent("p".to_string())));
        assert!(!hierarchy_dependencies("c", false).contains(&Dependency::Parent("c".to_string())));
        assert!(hierarchy_dependencies("c", false).contains(&Dependency::Hierarchy));
    }
}
