// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart against a SQLite database file.

mod common;

use std::sync::Arc;

use common::*;
use flowsync_core::checkpoint::CHECKPOINT_GROUP;
use flowsync_core::model::EntityType;
use flowsync_core::persistence::{DocumentQuery, DocumentStore, SqliteDocumentStore};
use serde_json::json;

async fn open(path: &std::path::Path) -> Arc<SqliteDocumentStore> {
    Arc::new(
        SqliteDocumentStore::from_path(path)
            .await
            .expect("Failed to open database file"),
    )
}

#[tokio::test]
async fn test_restart_resumes_from_flushed_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowsync.db");
    let ctx = TestContext::log(&[EntityType::ProcessInstance, EntityType::Activity]);
    ctx.source
        .push(
            EntityType::ProcessInstance,
            (1..=4).map(|n| instance_at(&format!("pi-{}", n), n, Some(n), json!({"state": "ACTIVE"}))),
        )
        .await;
    ctx.source
        .push(
            EntityType::Activity,
            [child_at("fn-1", "pi-1", 1, json!({"activityId": "start", "state": "COMPLETED"}))],
        )
        .await;

    {
        let store = open(&path).await;
        let mut scheduler = ctx.scheduler_with(store.clone()).await;
        assert_eq!(TestContext::drain(&mut scheduler, 10).await, 5);
        assert_eq!(scheduler.flush_checkpoints().await.unwrap(), 2);
        store.pool().close().await;
    }

    let store = open(&path).await;
    let checkpoints = store
        .search(CHECKPOINT_GROUP, &DocumentQuery::new())
        .await
        .unwrap();
    assert_eq!(checkpoints.len(), 2);

    let mut scheduler = ctx.scheduler_with(store.clone()).await;
    let records = scheduler.handle().checkpoints();
    assert_eq!(log_cursor(&records[0]).sequence, 4);
    assert_eq!(log_cursor(&records[1]).position, 1);
    assert_eq!(TestContext::drain(&mut scheduler, 10).await, 0);

    let docs = store
        .search("process-instance-order", &DocumentQuery::new())
        .await
        .unwrap();
    assert_eq!(docs.len(), 4);
    let pi1 = docs.iter().find(|d| d.id == "pi-1").unwrap();
    assert_eq!(pi1.body["flowNodes"][0]["activityId"], "start");
}

#[tokio::test]
async fn test_new_records_after_restart_are_merged_into_existing_documents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowsync.db");
    let ctx = TestContext::log(&[EntityType::ProcessInstance]);
    ctx.source
        .push(
            EntityType::ProcessInstance,
            [instance_at("pi-1", 1, None, json!({"state": "ACTIVE", "businessKey": "B-7"}))],
        )
        .await;

    {
        let store = open(&path).await;
        let mut scheduler = ctx.scheduler_with(store.clone()).await;
        TestContext::drain(&mut scheduler, 10).await;
        scheduler.flush_checkpoints().await.unwrap();
        store.pool().close().await;
    }

    ctx.source
        .push(
            EntityType::ProcessInstance,
            [instance_at("pi-1", 2, None, json!({"state": "COMPLETED"}))],
        )
        .await;
    let store = open(&path).await;
    let mut scheduler = ctx.scheduler_with(store.clone()).await;
    assert_eq!(TestContext::drain(&mut scheduler, 10).await, 1);

    let docs = store
        .search("process-instance-order", &DocumentQuery::by_ids(vec!["pi-1".to_string()]))
        .await
        .unwrap();
    assert_eq!(docs[0].version, 2);
    assert_eq!(docs[0].body["state"], "COMPLETED");
    assert_eq!(docs[0].body["businessKey"], "B-7");
}
