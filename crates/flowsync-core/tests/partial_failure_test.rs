// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partial write failures keep the checkpoint where it was.

mod common;

use common::*;
use flowsync_core::model::EntityType;
use serde_json::json;

async fn seed(ctx: &TestContext) {
    ctx.source
        .push(
            EntityType::ProcessInstance,
            (1..=3).map(|n| instance_at(&format!("pi-{}", n), n, None, json!({"state": "ACTIVE"}))),
        )
        .await;
}

#[tokio::test]
async fn test_failed_document_holds_back_the_cursor() {
    let ctx = TestContext::log(&[EntityType::ProcessInstance]);
    seed(&ctx).await;
    ctx.store.fail_writes_for("pi-2").await;
    let mut scheduler = ctx.scheduler().await;

    let report = scheduler.run_cycle().await;
    assert_eq!(report.failures, 1);
    assert_eq!(report.records, 0);

    // The other documents are written, the cursor stays put.
    let ids: Vec<String> = ctx.documents("process-instance-order").await.into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["pi-1", "pi-3"]);
    assert_eq!(log_cursor(&scheduler.handle().checkpoints()[0]).position, 0);

    // Still failing: the whole page is retried and fails again.
    assert_eq!(scheduler.run_cycle().await.failures, 1);

    ctx.store.clear_faults().await;
    assert_eq!(TestContext::drain(&mut scheduler, 5).await, 3);
    assert_eq!(ctx.store.documents("process-instance-order").await.len(), 3);
    assert_eq!(log_cursor(&scheduler.handle().checkpoints()[0]).position, 3);

    // Retried documents that were already written are not rewritten.
    assert_eq!(ctx.document("process-instance-order", "pi-1").await.version, 1);
}

#[tokio::test]
async fn test_failed_bulk_call_is_retried() {
    let ctx = TestContext::log(&[EntityType::ProcessInstance]);
    seed(&ctx).await;
    ctx.store.fail_next_bulk_calls(1).await;
    let mut scheduler = ctx.scheduler().await;

    let report = scheduler.run_cycle().await;
    assert_eq!(report.failures, 1);
    assert!(ctx.store.documents("process-instance-order").await.is_empty());
    assert!(scheduler.handle().checkpoints()[0].persisted_cursor.is_zero());

    assert_eq!(TestContext::drain(&mut scheduler, 5).await, 3);
    assert_eq!(ctx.store.documents("process-instance-order").await.len(), 3);
}

#[tokio::test]
async fn test_failure_in_one_stream_does_not_block_another() {
    let ctx = TestContext::log(&[EntityType::ProcessInstance, EntityType::Tenant]);
    seed(&ctx).await;
    ctx.source
        .push(
            EntityType::Tenant,
            [flowsync_core::model::SourceRecord::at_position("acme", 1, None, json!({"name": "Acme"}))],
        )
        .await;
    ctx.store.fail_writes_for("pi-1").await;
    let mut scheduler = ctx.scheduler().await;

    let report = scheduler.run_cycle().await;
    assert_eq!(report.failures, 1);
    assert_eq!(report.records, 1);

    let records = scheduler.handle().checkpoints();
    assert_eq!(log_cursor(&records[0]).position, 0);
    assert_eq!(log_cursor(&records[1]).position, 1);
}
