mod common;

use std::sync::Arc;

use chunk_cache::application::chunks::{ChunkService, ServiceError};
use chunk_cache::application::repos::SearchCacheRepo;
use chunk_cache::cache::{CacheConfig, CachedChunkService};
use chunk_cache::domain::entities::ChunkUpdate;
use chunk_cache::domain::search::{ContentFilters, SearchQuery};

use common::{InMemoryChunkService, chunk, child_of, sqlite_repo, tagged};

fn volatile_only() -> CacheConfig {
    CacheConfig {
        enable_persistent_cache: false,
        ..Default::default()
    }
}

fn content_query(content: &str) -> SearchQuery {
    SearchQuery {
        content: Some(content.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn repeated_reads_reach_the_source_once() {
    let source = InMemoryChunkService::new();
    let record = source.seed(chunk("hello"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);

    let first = service.get_chunk(&record.chunk_id).await.unwrap();
    let second = service.get_chunk(&record.chunk_id).await.unwrap();

    assert_eq!(first, record);
    assert_eq!(second, record);
    assert_eq!(source.calls("get_chunk"), 1);
}

#[tokio::test]
async fn errors_are_returned_and_never_cached() {
    let source = InMemoryChunkService::new();
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);

    for _ in 0..2 {
        let err = service.get_chunk("missing").await.unwrap_err();
        assert_eq!(err, ServiceError::not_found("missing"));
    }
    assert_eq!(source.calls("get_chunk"), 2);
}

#[tokio::test]
async fn update_refreshes_cached_chunk() {
    let source = InMemoryChunkService::new();
    let record = source.seed(chunk("before"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);
    service.get_chunk(&record.chunk_id).await.unwrap();

    let mut update = ChunkUpdate::new(record.chunk_id.clone());
    update.contents = Some("after".to_string());
    service.update_chunk(update).await.unwrap();

    let fresh = service.get_chunk(&record.chunk_id).await.unwrap();
    assert_eq!(fresh.contents, "after");
    assert_eq!(source.calls("get_chunk"), 2);
}

#[tokio::test]
async fn failed_write_leaves_cache_untouched() {
    let source = InMemoryChunkService::new();
    let record = source.seed(chunk("stable"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);
    service.get_chunk(&record.chunk_id).await.unwrap();

    source.set_fail_writes(true);
    let mut update = ChunkUpdate::new(record.chunk_id.clone());
    update.contents = Some("ignored".to_string());
    assert!(matches!(
        service.update_chunk(update).await,
        Err(ServiceError::Unavailable(_))
    ));

    service.get_chunk(&record.chunk_id).await.unwrap();
    assert_eq!(source.calls("get_chunk"), 1);
}

#[tokio::test]
async fn delete_drops_cached_chunk() {
    let source = InMemoryChunkService::new();
    let record = source.seed(chunk("short lived"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);
    service.get_chunk(&record.chunk_id).await.unwrap();

    service.delete_chunk(&record.chunk_id).await.unwrap();

    assert!(matches!(
        service.get_chunk(&record.chunk_id).await,
        Err(ServiceError::NotFound(_))
    ));
}

#[tokio::test]
async fn tagging_invalidates_dependents_only() {
    let source = InMemoryChunkService::new();
    source.seed_with_id("tag-rust", chunk("rust"));
    let note = source.seed(chunk("a note"));
    let parent = source.seed(chunk("parent"));
    source.seed(child_of(&parent.chunk_id, "child"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);

    assert!(service.get_chunks_by_tag("tag-rust").await.unwrap().is_empty());
    service.get_chunk(&note.chunk_id).await.unwrap();
    assert_eq!(service.get_children(&parent.chunk_id).await.unwrap().len(), 1);

    service
        .add_tags(&note.chunk_id, &["tag-rust".to_string()])
        .await
        .unwrap();

    let tagged = service.get_chunks_by_tag("tag-rust").await.unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].chunk_id, note.chunk_id);
    let refreshed = service.get_chunk(&note.chunk_id).await.unwrap();
    assert_eq!(refreshed.tags, vec!["tag-rust".to_string()]);
    service.get_children(&parent.chunk_id).await.unwrap();

    assert_eq!(source.calls("get_chunks_by_tag"), 2);
    assert_eq!(source.calls("get_chunk"), 2);
    assert_eq!(source.calls("get_children"), 1, "unrelated hierarchy kept");
}

#[tokio::test]
async fn removing_tags_refreshes_tag_lookups() {
    let source = InMemoryChunkService::new();
    let note = source.seed(tagged("note", &["draft"]));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);
    assert_eq!(service.get_chunks_by_tag("draft").await.unwrap().len(), 1);

    service
        .remove_tags(&note.chunk_id, &["draft".to_string()])
        .await
        .unwrap();

    assert!(service.get_chunks_by_tag("draft").await.unwrap().is_empty());
    assert_eq!(source.calls("get_chunks_by_tag"), 2);
}

#[tokio::test]
async fn move_refreshes_both_parents() {
    let source = InMemoryChunkService::new();
    let old_parent = source.seed(chunk("old parent"));
    let new_parent = source.seed(chunk("new parent"));
    let moved = source.seed(child_of(&old_parent.chunk_id, "moving"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);

    assert_eq!(service.get_children(&old_parent.chunk_id).await.unwrap().len(), 1);
    assert!(service.get_children(&new_parent.chunk_id).await.unwrap().is_empty());

    service
        .move_chunk(&moved.chunk_id, &new_parent.chunk_id)
        .await
        .unwrap();

    assert!(service.get_children(&old_parent.chunk_id).await.unwrap().is_empty());
    let children = service.get_children(&new_parent.chunk_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].chunk_id, moved.chunk_id);
    assert_eq!(source.calls("get_children"), 4);
}

#[tokio::test]
async fn create_clears_every_cached_read() {
    let source = InMemoryChunkService::new();
    let root = source.seed(chunk("root"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);
    service.get_chunk(&root.chunk_id).await.unwrap();
    service.get_ancestors(&root.chunk_id).await.unwrap();
    assert!(service.cache().volatile_stats().size >= 2);

    service
        .create_chunk(child_of(&root.chunk_id, "new"))
        .await
        .unwrap();

    assert_eq!(service.cache().volatile_stats().size, 0);
    service.get_chunk(&root.chunk_id).await.unwrap();
    assert_eq!(source.calls("get_chunk"), 2);
}

#[tokio::test]
async fn content_search_shares_the_search_cache() {
    let source = InMemoryChunkService::new();
    source.seed(chunk("learning rust"));
    source.seed(chunk("cooking"));
    let service = CachedChunkService::from_config(source.clone(), &volatile_only(), None);

    let filters = ContentFilters::default();
    let first = service.search_by_content("rust", &filters).await.unwrap();
    let second = service.search_by_content("rust", &filters).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first, second);
    assert_eq!(source.calls("search_chunks"), 1);
    assert_eq!(source.calls("search_by_content"), 0);
}

#[tokio::test]
async fn search_is_served_from_the_persistent_tier_after_restart() {
    let source = InMemoryChunkService::new();
    source.seed(chunk("rust ownership"));
    source.seed(chunk("rust lifetimes"));
    source.seed(chunk("gardening"));
    let repo: Arc<dyn SearchCacheRepo> = Arc::new(sqlite_repo().await);
    let config = CacheConfig::default();
    let query = content_query("rust");

    let first = CachedChunkService::from_config(source.clone(), &config, Some(repo.clone()));
    let miss = first.search_chunks(&query).await.unwrap();
    assert!(!miss.cache_hit);
    assert_eq!(miss.chunks.len(), 2);
    let hit = first.search_chunks(&query).await.unwrap();
    assert!(hit.cache_hit);
    assert_eq!(hit.chunks, miss.chunks);
    assert_eq!(source.calls("search_chunks"), 1);
    assert_eq!(repo.count_entries().await.unwrap(), 1);

    // A fresh volatile tier, same database.
    let second = CachedChunkService::from_config(source.clone(), &config, Some(repo.clone()));
    let persisted = second.search_chunks(&query).await.unwrap();

    assert!(persisted.cache_hit);
    assert_eq!(persisted.chunks, miss.chunks);
    assert_eq!(persisted.total_count, 2);
    assert_eq!(source.calls("search_chunks"), 1);
    assert_eq!(source.calls("get_chunks_by_ids"), 1);

    second.create_chunk(chunk("rust macros")).await.unwrap();
    assert_eq!(repo.count_entries().await.unwrap(), 0);

    let refreshed = second.search_chunks(&query).await.unwrap();
    assert!(!refreshed.cache_hit);
    assert_eq!(refreshed.chunks.len(), 3);
    assert_eq!(source.calls("search_chunks"), 2);

    first.cache().shutdown().await;
    second.cache().shutdown().await;
}

#[tokio::test]
async fn persistent_tier_serves_searches_without_a_volatile_tier() {
    let source = InMemoryChunkService::new();
    source.seed(chunk("rust traits"));
    source.seed(chunk("baking"));
    let repo: Arc<dyn SearchCacheRepo> = Arc::new(sqlite_repo().await);
    let config = CacheConfig {
        enable_volatile_cache: false,
        ..Default::default()
    };
    let service = CachedChunkService::from_config(source.clone(), &config, Some(repo.clone()));
    let query = content_query("rust");

    let miss = service.search_chunks(&query).await.unwrap();
    let hit = service.search_chunks(&query).await.unwrap();

    assert!(!miss.cache_hit);
    assert!(hit.cache_hit);
    assert_eq!(hit.chunks, miss.chunks);
    assert_eq!(source.calls("search_chunks"), 1);
    assert_eq!(source.calls("get_chunks_by_ids"), 1);
    assert_eq!(service.cache().volatile_stats().size, 0);

    service.cache().shutdown().await;
}

#[tokio::test]
async fn tagging_and_moving_clear_persisted_searches() {
    let source = InMemoryChunkService::new();
    let parent = source.seed(chunk("rust parent"));
    let note = source.seed(chunk("rust note"));
    let repo: Arc<dyn SearchCacheRepo> = Arc::new(sqlite_repo().await);
    let service =
        CachedChunkService::from_config(source.clone(), &CacheConfig::default(), Some(repo.clone()));
    let query = content_query("rust");

    service.search_chunks(&query).await.unwrap();
    assert_eq!(repo.count_entries().await.unwrap(), 1);
    service
        .add_tags(&note.chunk_id, &["tag-rust".to_string()])
        .await
        .unwrap();
    assert_eq!(repo.count_entries().await.unwrap(), 0);

    let after_tagging = service.search_chunks(&query).await.unwrap();
    assert!(!after_tagging.cache_hit);
    assert_eq!(repo.count_entries().await.unwrap(), 1);
    service
        .move_chunk(&note.chunk_id, &parent.chunk_id)
        .await
        .unwrap();
    assert_eq!(repo.count_entries().await.unwrap(), 0);

    assert!(!service.search_chunks(&query).await.unwrap().cache_hit);
    assert_eq!(source.calls("search_chunks"), 3);

    service.cache().shutdown().await;
}

#[tokio::test]
async fn disabled_cache_forwards_every_call() {
    let source = InMemoryChunkService::new();
    let record = source.seed(chunk("plain"));
    let config = CacheConfig {
        enable_volatile_cache: false,
        enable_persistent_cache: false,
        ..Default::default()
    };
    let service = CachedChunkService::from_config(source.clone(), &config, None);

    for _ in 0..3 {
        service.get_chunk(&record.chunk_id).await.unwrap();
        let result = service.search_chunks(&content_query("plain")).await.unwrap();
        assert!(!result.cache_hit);
    }

    assert_eq!(source.calls("get_chunk"), 3);
    assert_eq!(source.calls("search_chunks"), 3);
    assert_eq!(service.cache().volatile_stats().size, 0);
}
