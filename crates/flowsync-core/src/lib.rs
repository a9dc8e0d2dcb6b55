// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! flowsync Core - Incremental Import Engine
//!
//! Pulls history from BPM engines and exported event logs and folds it into
//! denormalized documents (definitions, process instances with their flow
//! nodes, incidents, variables and user tasks, tenants). Import is resumable:
//! every `(data source, entity type)` stream keeps a checkpoint that only
//! advances after the documents covering it were written.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         ImportRegistry                            │
//! │   ┌──────────────────────┐           ┌──────────────────────┐     │
//! │   │ ImportScheduler (A)  │    ...    │ ImportScheduler (N)  │     │
//! │   │  round-robin cycles  │           │  round-robin cycles  │     │
//! │   └──────────┬───────────┘           └──────────────────────┘     │
//! └──────────────┼────────────────────────────────────────────────────┘
//!                │ one round per entity type
//!                ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ ImportMediator                                                    │
//! │   Checkpoint ──► Fetcher ──► transform ──► MergeWriter ──► confirm│
//! └──────┬───────────────┬──────────────────────────┬─────────────────┘
//!        │               │                          │
//!        ▼               ▼                          ▼
//! ┌──────────────┐ ┌──────────────────┐ ┌──────────────────────────────┐
//! │ Checkpoint   │ │ Upstream source  │ │ DocumentStore                │
//! │ store        │ │ (engine history  │ │ (SQLite or in-memory), with  │
//! │              │ │  or event log)   │ │ partitioned queries          │
//! └──────────────┘ └──────────────────┘ └──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`checkpoint`] | Cursors, checkpoint state machine and durable storage |
//! | [`partition`] | Splits queries that exceed the store's clause limit |
//! | [`fetcher`] | Next page of a timestamp or log stream |
//! | [`transform`] | Records to document fragments |
//! | [`merge`] | Idempotent field rules, definition soft delete, bulk writes |
//! | [`mediator`] | One fetch/transform/write/advance round |
//! | [`scheduler`] | Per data source round-robin, flushing and control |
//! | [`registry`] | Every scheduler of the process |
//! | [`persistence`] | Document store trait with SQLite and memory backends |
//! | [`source`] | Upstream adapter traits, file and memory sources |
//!
//! # Round State Machine
//!
//! ```text
//! IDLE ──► FETCHING ──┬── empty ──────────────────────────────► IDLE (backoff)
//!                     └── page ──► TRANSFORMING ──► WRITING ──┬─► ADVANCING ──► IDLE
//!                                                             └─► IDLE (cursor unchanged)
//! ```

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod mediator;
pub mod merge;
pub mod model;
pub mod paging;
pub mod partition;
pub mod persistence;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod transform;

pub use checkpoint::{Checkpoint, CheckpointRecord, CheckpointStore, Cursor, LogCursor, TimestampCursor};
pub use config::{Config, ConfigError, DataSourceConfig, ImportConfig};
pub use error::{ImportError, Result};
pub use mediator::{ImportMediator, RoundOutcome};
pub use merge::{MergeWriter, WriteReport};
pub use model::{DataSourceId, EntityType, SourceKind, SourceRecord, StreamOrder};
pub use partition::PartitionedQueryExecutor;
pub use persistence::{DocumentStore, MemoryDocumentStore, SqliteDocumentStore};
pub use registry::ImportRegistry;
pub use scheduler::{ImportScheduler, SchedulerHandle};
pub use source::{FileSource, MemorySource, SourceAdapter, SourceError};
