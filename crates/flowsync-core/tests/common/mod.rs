// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowsync-core integration tests.
//!
//! Provides TestContext wiring an in-memory upstream source and document
//! store into schedulers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

use flowsync_core::checkpoint::{CheckpointRecord, Cursor, LogCursor, TimestampCursor};
use flowsync_core::config::{DataSourceConfig, ImportConfig};
use flowsync_core::merge::without_orders;
use flowsync_core::model::{EntityType, SourceKind, SourceRecord};
use flowsync_core::persistence::{DocumentStore, MemoryDocumentStore, StoredDocument};
use flowsync_core::scheduler::ImportScheduler;
use flowsync_core::source::{MemorySource, SourceAdapter};

/// Test context sharing one upstream and one store across scheduler rebuilds.
pub struct TestContext {
    pub store: Arc<MemoryDocumentStore>,
    pub source: MemorySource,
    pub data_source: DataSourceConfig,
    pub import: ImportConfig,
}

impl TestContext {
    /// Context for an exported event log.
    pub fn log(entities: &[EntityType]) -> Self {
        Self::new(SourceKind::Log, entities)
    }

    /// Context for an engine history source.
    pub fn engine(entities: &[EntityType]) -> Self {
        Self::new(SourceKind::Engine, entities)
    }

    fn new(kind: SourceKind, entities: &[EntityType]) -> Self {
        let mut data_source = DataSourceConfig::new("source-1", kind, "/unused");
        data_source.entities = entities.to_vec();
        Self {
            store: Arc::new(MemoryDocumentStore::new()),
            source: MemorySource::new(),
            data_source,
            import: ImportConfig {
                min_page_size: 1,
                backoff_base: Duration::ZERO,
                backoff_max: Duration::ZERO,
                checkpoint_flush_interval: Duration::from_secs(3600),
                skew_window: Duration::ZERO,
                ..ImportConfig::default()
            },
        }
    }

    /// Set the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.import.page_size = page_size;
        self
    }

    /// Build a scheduler over the shared store and source.
    pub async fn scheduler(&self) -> ImportScheduler {
        self.scheduler_with(self.store.clone()).await
    }

    /// Build a scheduler writing into another store.
    pub async fn scheduler_with(&self, store: Arc<dyn DocumentStore>) -> ImportScheduler {
        let adapter = match self.data_source.kind {
            SourceKind::Engine => SourceAdapter::Timestamp(Arc::new(self.source.clone())),
            SourceKind::Log => SourceAdapter::Log(Arc::new(self.source.clone())),
        };
        ImportScheduler::build(&self.data_source, adapter, store, &self.import)
            .await
            .expect("Failed to build scheduler")
    }

    /// Run cycles until one imports nothing; returns the records imported.
    pub async fn drain(scheduler: &mut ImportScheduler, max_cycles: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_cycles {
            let report = scheduler.run_cycle().await;
            if report.records == 0 && report.failures == 0 {
                return total;
            }
            total += report.records;
        }
        panic!("import did not settle within {} cycles", max_cycles);
    }

    /// Documents of a group without merge bookkeeping, ordered by id.
    pub async fn documents(&self, group: &str) -> Vec<(String, Value)> {
        self.store
            .documents(group)
            .await
            .into_iter()
            .map(|doc| (doc.id, without_orders(&doc.body)))
            .collect()
    }

    /// One stored document.
    pub async fn document(&self, group: &str, id: &str) -> StoredDocument {
        self.store
            .get(group, id)
            .await
            .unwrap_or_else(|| panic!("document {}/{} not found", group, id))
    }
}

/// Fixed upstream time, well outside any skew window.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// A process instance record positioned in a log.
pub fn instance_at(id: &str, position: i64, sequence: Option<i64>, fields: Value) -> SourceRecord {
    SourceRecord::at_position(id, position, sequence, with_instance_key(fields))
}

/// A process instance record in an engine history.
pub fn instance_timed(id: &str, secs: i64, fields: Value) -> SourceRecord {
    SourceRecord::at_time(id, at(secs), with_instance_key(fields))
}

/// A child record (activity, incident, ...) of instance `instance_id`.
pub fn child_at(id: &str, instance_id: &str, position: i64, fields: Value) -> SourceRecord {
    let mut payload = with_instance_key(fields);
    payload["processInstanceId"] = json!(instance_id);
    SourceRecord::at_position(id, position, None, payload)
}

fn with_instance_key(mut fields: Value) -> Value {
    if fields.get("processDefinitionKey").is_none() {
        fields["processDefinitionKey"] = json!("order");
    }
    fields
}

/// Position of a log checkpoint record.
pub fn log_cursor(record: &CheckpointRecord) -> LogCursor {
    match &record.persisted_cursor {
        Cursor::Log(cursor) => *cursor,
        other => panic!("expected log cursor, got {:?}", other),
    }
}

/// Timestamp cursor of an engine checkpoint record.
pub fn timestamp_cursor(record: &CheckpointRecord) -> TimestampCursor {
    match &record.persisted_cursor {
        Cursor::Timestamp(cursor) => cursor.clone(),
        other => panic!("expected timestamp cursor, got {:?}", other),
    }
}
