// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end import of JSON lines exports through the registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowsync_core::checkpoint::CHECKPOINT_GROUP;
use flowsync_core::config::{DataSourceConfig, ImportConfig};
use flowsync_core::model::{EntityType, SourceKind, SourceRecord};
use flowsync_core::persistence::MemoryDocumentStore;
use flowsync_core::registry::ImportRegistry;
use flowsync_core::source::{FileSource, SourceAdapter};
use serde_json::json;
use tokio::io::AsyncWriteExt;

async fn append(dir: &Path, entity_type: EntityType, records: &[SourceRecord]) {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.jsonl", entity_type)))
        .await
        .unwrap();
    for record in records {
        let mut line = serde_json::to_string(record).unwrap();
        line.push('\n');
        file.write_all(line.as_bytes()).await.unwrap();
    }
    file.flush().await.unwrap();
}

fn instance(id: &str, position: i64, state: &str) -> SourceRecord {
    SourceRecord::at_position(
        id,
        position,
        None,
        json!({"processDefinitionKey": "invoice", "state": state}),
    )
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn import() -> ImportConfig {
    ImportConfig {
        tick_interval: Duration::from_millis(5),
        min_page_size: 1,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        checkpoint_flush_interval: Duration::from_secs(3600),
        skew_window: Duration::ZERO,
        ..ImportConfig::default()
    }
}

#[tokio::test]
async fn test_registry_imports_appended_lines_and_flushes_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    append(dir.path(), EntityType::ProcessInstance, &[instance("pi-1", 1, "ACTIVE")]).await;

    let store = Arc::new(MemoryDocumentStore::new());
    let mut registry = ImportRegistry::new(store.clone(), import());
    let mut source = DataSourceConfig::new("exports", SourceKind::Log, dir.path());
    source.entities = vec![EntityType::ProcessInstance];
    let adapter = SourceAdapter::Log(Arc::new(FileSource::new(dir.path())));
    registry.register(&source, adapter).await.unwrap();
    assert_eq!(registry.spawn_all(), 1);

    wait_for(|| {
        let store = store.clone();
        async move { store.get("process-instance-invoice", "pi-1").await.is_some() }
    })
    .await;

    append(
        dir.path(),
        EntityType::ProcessInstance,
        &[instance("pi-1", 2, "COMPLETED"), instance("pi-2", 3, "ACTIVE")],
    )
    .await;
    wait_for(|| {
        let store = store.clone();
        async move {
            store
                .get("process-instance-invoice", "pi-1")
                .await
                .is_some_and(|doc| doc.body["state"] == "COMPLETED")
                && store.get("process-instance-invoice", "pi-2").await.is_some()
        }
    })
    .await;

    // The flush interval never elapsed; shutdown flushes.
    assert!(store.documents(CHECKPOINT_GROUP).await.is_empty());
    registry.shutdown_all().await;

    let checkpoint = store
        .get(CHECKPOINT_GROUP, "exports:process-instance")
        .await
        .expect("checkpoint flushed on shutdown");
    assert_eq!(checkpoint.body["persistedCursor"]["position"], 3);
}

#[tokio::test]
async fn test_registry_rejects_duplicates_and_unknown_handles() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryDocumentStore::new());
    let mut registry = ImportRegistry::new(store, import());
    let source = DataSourceConfig::new("exports", SourceKind::Log, dir.path());

    let adapter = || SourceAdapter::Log(Arc::new(FileSource::new(dir.path())));
    registry.register(&source, adapter()).await.unwrap();
    assert!(registry.register(&source, adapter()).await.is_err());
    assert!(registry.handle("missing").is_err());

    let handle = registry.handle("exports").unwrap();
    handle.disable();
    assert!(!handle.is_enabled());
    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_malformed_line_fails_the_round_without_moving_the_cursor() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("tenant.jsonl"), "{not json}\n")
        .await
        .unwrap();

    let store = Arc::new(MemoryDocumentStore::new());
    let mut source = DataSourceConfig::new("exports", SourceKind::Log, dir.path());
    source.entities = vec![EntityType::Tenant];
    let mut scheduler = flowsync_core::scheduler::ImportScheduler::build(
        &source,
        SourceAdapter::Log(Arc::new(FileSource::new(dir.path()))),
        store,
        &import(),
    )
    .await
    .unwrap();

    let report = scheduler.run_cycle().await;
    assert_eq!(report.failures, 1);
    assert!(scheduler.handle().checkpoints()[0].persisted_cursor.is_zero());
}
