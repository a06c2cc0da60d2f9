//! End-to-end behavior of the query pipeline over JSON partition files.

use std::sync::Arc;
use std::time::Duration;

use flatshard_core::{Predicate, Query, SortDirection};
use flatshard_engine::storage::{JsonFileStorage, MemoryManifest};
use flatshard_engine::{EngineConfig, ErrorKind, QueryPipeline, StoragePort};
use serde_json::json;

async fn pipeline_over(dir: &tempfile::TempDir, config: EngineConfig) -> QueryPipeline {
    let storage = Arc::new(JsonFileStorage::new(dir.path()));
    storage.connect().await.unwrap();
    let manifest = Arc::new(MemoryManifest::from_directory(dir.path()).await.unwrap());
    QueryPipeline::new(storage as Arc<dyn StoragePort>, manifest, config)
}

fn write_fixtures(dir: &tempfile::TempDir) {
    std::fs::write(
        dir.path().join("orders-2023.json"),
        r#"[{"id": "o1", "total": 40, "status": "paid"}, {"id": "o2", "total": 15, "status": "open"}]"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("orders-2024.jsonl"),
        "{\"id\": \"o3\", \"total\": 99, \"status\": \"paid\"}\n{\"id\": \"o4\", \"total\": 5, \"status\": \"paid\"}\n",
    )
    .unwrap();
}

#[tokio::test]
async fn repeated_query_is_idempotent_and_cached() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(&dir);
    let pipeline = pipeline_over(&dir, EngineConfig::default()).await;

    let query = Query::new()
        .filter(Predicate::from_json(&json!({"status": "paid", "total": {"$gt": 10}})).unwrap())
        .sort_by("total", SortDirection::Desc);

    let first = pipeline.query(&query).await.unwrap();
    let second = pipeline.query(&query).await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.data, second.data);
    let ids: Vec<_> = first.data.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!("o3"), json!("o1")]);
}

#[tokio::test]
async fn write_invalidates_and_is_visible_to_next_query() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(&dir);
    let pipeline = pipeline_over(&dir, EngineConfig::default()).await;
    let paid = Query::new().filter(Predicate::eq("status", json!("paid")));

    assert_eq!(pipeline.query(&paid).await.unwrap().total, 3);

    pipeline
        .insert(vec![json!({"total": 12, "status": "paid"})], Some("orders-2024"))
        .await
        .unwrap();
    let after_insert = pipeline.query(&paid).await.unwrap();
    assert!(!after_insert.cache_hit);
    assert_eq!(after_insert.total, 4);

    let changes = json!({"status": "refunded"});
    let updated = pipeline
        .update(&Predicate::eq("id", json!("o1")), changes.as_object().unwrap(), None)
        .await
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(pipeline.query(&paid).await.unwrap().total, 3);

    let removed = pipeline
        .delete(&Predicate::lt("total", json!(10)), None)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(pipeline.query(&paid).await.unwrap().total, 2);

    let on_disk = std::fs::read_to_string(dir.path().join("orders-2024.jsonl")).unwrap();
    assert_eq!(on_disk.lines().count(), 2);
}

#[tokio::test]
async fn insert_into_new_default_partition_creates_file() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline_over(&dir, EngineConfig::default()).await;

    let stored = pipeline.insert(vec![json!({"name": "first"})], None).await.unwrap();
    let id = stored[0]["id"].as_str().unwrap().to_string();

    assert!(dir.path().join("default.jsonl").exists());
    let fetched = pipeline.get(id).await.unwrap().unwrap();
    assert_eq!(fetched["name"], json!("first"));
    assert_eq!(pipeline.count(None, None).await.unwrap(), 1);
}

#[tokio::test]
async fn corrupt_partition_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(&dir);
    std::fs::write(dir.path().join("broken.json"), "[{\"id\": ").unwrap();

    let mut config = EngineConfig::default();
    config.map_reduce.retry_config.max_retries = 1;
    config.map_reduce.retry_config.base_delay = Duration::from_millis(1);
    let pipeline = pipeline_over(&dir, config).await;

    let result = pipeline.query(&Query::new()).await.unwrap();
    assert_eq!(result.total, 4);
    let stats = result.statistics.unwrap();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.partitions_processed, 2);

    let err = pipeline
        .query(&Query::new().in_partitions(vec!["missing".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn background_sweeper_expires_cached_queries() {
    let dir = tempfile::tempdir().unwrap();
    write_fixtures(&dir);
    let mut config = EngineConfig::default();
    config.cache.ttl = Duration::from_millis(20);
    config.cache.sweep_interval = Duration::from_millis(30);
    let pipeline = pipeline_over(&dir, config).await;
    let mut sweeper = pipeline.start_cache_sweeper().unwrap();

    pipeline.query(&Query::new()).await.unwrap();
    assert_eq!(pipeline.cache().unwrap().size(), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(pipeline.cache().unwrap().size(), 0);
    sweeper.stop().await;
}
