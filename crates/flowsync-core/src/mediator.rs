// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Import mediator: one round of fetch, transform, write and advance for a
//! single `(data source, entity type)` stream.
//!
//! ```text
//! IDLE -> FETCHING -+-> empty ------------------------------> IDLE (backoff)
//!                   +-> page -> TRANSFORMING -> WRITING -+-> ADVANCING -> IDLE
//!                                                        +-> IDLE (cursor unchanged)
//! ```
//!
//! A round never starts while the previous page is unconfirmed: the pending
//! cursor is either confirmed or discarded before `run_round` returns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointError, Cursor};
use crate::fetcher::{FetchMode, FetchPage, Fetcher};
use crate::merge::MergeWriter;
use crate::model::EntityType;
use crate::paging::{AdaptivePageSize, BackoffPolicy};
use crate::source::{SourceError, SourceErrorKind};
use crate::transform::{TransformContext, TransformError, transform_page};

/// Where a mediator is in its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediatorState {
    /// Between rounds.
    Idle,
    /// Waiting for the upstream page.
    Fetching,
    /// Turning records into fragments.
    Transforming,
    /// Waiting for the merge writer.
    Writing,
    /// Confirming the cursor.
    Advancing,
}

/// Why a round did not advance the checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundFailure {
    /// Upstream fetch failed.
    Fetch(SourceError),
    /// A record of the page was malformed.
    Transform(TransformError),
    /// Some fragments were not stored.
    Write {
        /// Fragments committed before the failure.
        committed: usize,
        /// Fragments not stored.
        failed: usize,
    },
    /// Cursor bookkeeping rejected the page.
    Checkpoint(CheckpointError),
}

/// Result of [`ImportMediator::run_round`].
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Backoff has not elapsed; nothing was fetched.
    Skipped,
    /// The page held no records to import.
    Idle,
    /// A page was written and the cursor advanced.
    Imported {
        /// Records written.
        records: usize,
        /// Whether the stream has no more data right now.
        caught_up: bool,
    },
    /// The round was abandoned; the cursor is unchanged.
    Failed(RoundFailure),
}

impl RoundOutcome {
    /// Whether the round moved the checkpoint forward or found nothing to do.
    pub fn is_success(&self) -> bool {
        !matches!(self, RoundOutcome::Failed(_))
    }
}

/// Drives one checkpoint through fetch/transform/write rounds.
pub struct ImportMediator {
    checkpoint: Checkpoint,
    fetcher: Fetcher,
    writer: MergeWriter,
    transform: TransformContext,
    page_size: AdaptivePageSize,
    backoff: BackoffPolicy,
    state: MediatorState,
}

impl ImportMediator {
    /// Create a mediator owning `checkpoint`.
    pub fn new(
        checkpoint: Checkpoint,
        fetcher: Fetcher,
        writer: MergeWriter,
        transform: TransformContext,
        page_size: AdaptivePageSize,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            checkpoint,
            fetcher,
            writer,
            transform,
            page_size,
            backoff,
            state: MediatorState::Idle,
        }
    }

    /// Stream this mediator imports.
    pub fn entity_type(&self) -> EntityType {
        self.checkpoint.entity_type()
    }

    /// Owned checkpoint.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Mutable access for flushing and resetting between rounds.
    pub fn checkpoint_mut(&mut self) -> &mut Checkpoint {
        &mut self.checkpoint
    }

    /// Current round state.
    pub fn state(&self) -> MediatorState {
        self.state
    }

    /// Current page size.
    pub fn page_size(&self) -> usize {
        self.page_size.current()
    }

    /// Run one round if the checkpoint is due at `now`.
    pub async fn run_round(&mut self, now: DateTime<Utc>) -> RoundOutcome {
        if !self.checkpoint.is_due(now) {
            return RoundOutcome::Skipped;
        }

        self.state = MediatorState::Fetching;
        let cursor = self.checkpoint.persisted_cursor().clone();
        let page = match self
            .fetcher
            .next_page(&cursor, self.page_size.current(), now)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.log_fetch_failure(&e);
                if e.kind == SourceErrorKind::PayloadTooLarge {
                    self.page_size.shrink();
                }
                return self.abandon(now, RoundFailure::Fetch(e));
            }
        };

        if page.records.is_empty() {
            return self.finish_empty(now, &cursor, page);
        }

        self.state = MediatorState::Transforming;
        let candidate = match self.checkpoint.propose_advance(page.next_cursor.clone()) {
            Ok(candidate) => candidate,
            Err(e) => {
                error!(entity_type = %self.entity_type(), error = %e, "Page cursor rejected");
                return self.abandon(now, RoundFailure::Checkpoint(e));
            }
        };
        let fragments = match transform_page(&page, &self.transform) {
            Ok(fragments) => fragments,
            Err(e) => {
                error!(entity_type = %self.entity_type(), error = %e, "Malformed record, round abandoned");
                return self.abandon(now, RoundFailure::Transform(e));
            }
        };

        self.state = MediatorState::Writing;
        let report = self.writer.write(&fragments).await;
        if !report.is_complete() {
            warn!(
                data_source = %self.checkpoint.data_source_id(),
                entity_type = %self.entity_type(),
                committed = report.committed.len(),
                failed = report.failed_count(),
                "Partial write, page will be retried"
            );
            return self.abandon(
                now,
                RoundFailure::Write {
                    committed: report.committed.len(),
                    failed: report.failed_count(),
                },
            );
        }

        self.state = MediatorState::Advancing;
        if let Err(e) = self.checkpoint.confirm(&candidate) {
            error!(entity_type = %self.entity_type(), error = %e, "Checkpoint confirm failed");
            return self.abandon(now, RoundFailure::Checkpoint(e));
        }

        self.page_size.settle();
        let backoff = if page.caught_up {
            self.backoff.next(self.checkpoint.backoff())
        } else {
            self.backoff.reset()
        };
        self.checkpoint.record_round(now, backoff);
        self.state = MediatorState::Idle;

        info!(
            data_source = %self.checkpoint.data_source_id(),
            entity_type = %self.entity_type(),
            records = page.records.len(),
            documents = report.documents_written,
            caught_up = page.caught_up,
            "Imported page"
        );
        RoundOutcome::Imported {
            records: page.records.len(),
            caught_up: page.caught_up,
        }
    }

    fn finish_empty(&mut self, now: DateTime<Utc>, cursor: &Cursor, page: FetchPage) -> RoundOutcome {
        // Records of excluded tenants still move the cursor.
        if page.next_cursor != *cursor {
            self.state = MediatorState::Advancing;
            let advanced = self
                .checkpoint
                .propose_advance(page.next_cursor.clone())
                .and_then(|candidate| self.checkpoint.confirm(&candidate));
            if let Err(e) = advanced {
                error!(entity_type = %self.entity_type(), error = %e, "Checkpoint advance failed");
                return self.abandon(now, RoundFailure::Checkpoint(e));
            }
        }

        let backoff = if page.caught_up {
            if page.mode == FetchMode::Sequence {
                self.page_size.grow();
            }
            self.backoff.next(self.checkpoint.backoff())
        } else {
            self.backoff.reset()
        };
        self.checkpoint.record_round(now, backoff);
        self.state = MediatorState::Idle;

        debug!(
            data_source = %self.checkpoint.data_source_id(),
            entity_type = %self.entity_type(),
            backoff_ms = backoff_ms(backoff),
            "Caught up"
        );
        RoundOutcome::Idle
    }

    fn abandon(&mut self, now: DateTime<Utc>, failure: RoundFailure) -> RoundOutcome {
        self.checkpoint.discard_pending();
        let backoff = self.backoff.next(self.checkpoint.backoff());
        self.checkpoint.record_round(now, backoff);
        self.state = MediatorState::Idle;
        RoundOutcome::Failed(failure)
    }

    fn log_fetch_failure(&self, e: &SourceError) {
        let data_source = self.checkpoint.data_source_id();
        let entity_type = self.entity_type();
        match e.kind {
            SourceErrorKind::Unauthorized => error!(
                data_source = %data_source,
                entity_type = %entity_type,
                error = %e,
                "Upstream rejected credentials, check the data source authorization"
            ),
            SourceErrorKind::Transient => warn!(
                data_source = %data_source,
                entity_type = %entity_type,
                error = %e,
                "Transient fetch failure"
            ),
            SourceErrorKind::PayloadTooLarge => warn!(
                data_source = %data_source,
                entity_type = %entity_type,
                page_size = self.page_size.current(),
                error = %e,
                "Upstream response too large, shrinking page"
            ),
            SourceErrorKind::Fatal => error!(
                data_source = %data_source,
                entity_type = %entity_type,
                error = %e,
                "Fetch failed"
            ),
        }
    }
}

fn backoff_ms(backoff: Duration) -> u64 {
    u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::LogCursor;
    use crate::fetcher::FetcherSettings;
    use crate::model::{DataSourceId, SourceKind, SourceRecord};
    use crate::persistence::MemoryDocumentStore;
    use crate::source::{MemorySource, SourceAdapter};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn mediator(source: &MemorySource, store: &Arc<MemoryDocumentStore>, page: usize) -> ImportMediator {
        let adapter = SourceAdapter::Log(Arc::new(source.clone()));
        ImportMediator::new(
            Checkpoint::zero(DataSourceId::new("log-1"), EntityType::ProcessInstance, SourceKind::Log),
            Fetcher::new(&adapter, EntityType::ProcessInstance, FetcherSettings::default()),
            MergeWriter::new(store.clone(), Duration::from_secs(5)),
            TransformContext::default(),
            AdaptivePageSize::new(page, 1, 8),
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8)),
        )
    }

    async fn push_instances(source: &MemorySource, range: std::ops::RangeInclusive<i64>) {
        source
            .push(
                EntityType::ProcessInstance,
                range.map(|n| {
                    SourceRecord::at_position(
                        format!("pi-{}", n),
                        n,
                        Some(n),
                        json!({"processDefinitionKey": "order", "state": "ACTIVE"}),
                    )
                }),
            )
            .await;
    }

    fn position(mediator: &ImportMediator) -> i64 {
        match mediator.checkpoint().persisted_cursor() {
            Cursor::Log(LogCursor { position, .. }) => *position,
            other => panic!("unexpected cursor {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_imports_page_and_advances() {
        let source = MemorySource::new();
        let store = Arc::new(MemoryDocumentStore::new());
        push_instances(&source, 1..=3).await;
        let mut mediator = mediator(&source, &store, 2);

        let outcome = mediator.run_round(at(0)).await;
        assert_eq!(
            outcome,
            RoundOutcome::Imported {
                records: 2,
                caught_up: false
            }
        );
        assert_eq!(position(&mediator), 2);
        assert!(mediator.checkpoint().is_dirty());
        assert_eq!(mediator.state(), MediatorState::Idle);
        assert_eq!(store.documents("process-instance-order").await.len(), 2);

        // Not caught up: the next round is due immediately.
        let outcome = mediator.run_round(at(0)).await;
        assert_eq!(
            outcome,
            RoundOutcome::Imported {
                records: 1,
                caught_up: true
            }
        );
        assert_eq!(mediator.checkpoint().backoff(), Duration::from_secs(1));
        assert_eq!(mediator.run_round(at(0)).await, RoundOutcome::Skipped);
        assert_eq!(mediator.run_round(at(1)).await, RoundOutcome::Idle);
        assert_eq!(mediator.checkpoint().backoff(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_partial_write_keeps_cursor() {
        let source = MemorySource::new();
        let store = Arc::new(MemoryDocumentStore::new());
        push_instances(&source, 1..=3).await;
        store.fail_writes_for("pi-2").await;
        let mut mediator = mediator(&source, &store, 5);

        let outcome = mediator.run_round(at(0)).await;
        assert_eq!(
            outcome,
            RoundOutcome::Failed(RoundFailure::Write {
                committed: 2,
                failed: 1
            })
        );
        assert_eq!(position(&mediator), 0);
        assert!(mediator.checkpoint().pending_cursor().is_none());

        store.clear_faults().await;
        let outcome = mediator.run_round(at(10)).await;
        assert!(matches!(outcome, RoundOutcome::Imported { records: 3, .. }));
        assert_eq!(position(&mediator), 3);
        assert_eq!(store.documents("process-instance-order").await.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_failures_back_off_without_advancing() {
        let source = MemorySource::new();
        let store = Arc::new(MemoryDocumentStore::new());
        push_instances(&source, 1..=1).await;
        source.fail_next(SourceErrorKind::Unauthorized).await;
        source.fail_next(SourceErrorKind::Transient).await;
        let mut mediator = mediator(&source, &store, 5);

        let outcome = mediator.run_round(at(0)).await;
        assert!(matches!(
            outcome,
            RoundOutcome::Failed(RoundFailure::Fetch(SourceError {
                kind: SourceErrorKind::Unauthorized,
                ..
            }))
        ));
        assert_eq!(mediator.checkpoint().backoff(), Duration::from_secs(1));

        let outcome = mediator.run_round(at(1)).await;
        assert!(!outcome.is_success());
        assert_eq!(mediator.checkpoint().backoff(), Duration::from_secs(2));
        assert_eq!(position(&mediator), 0);

        let outcome = mediator.run_round(at(3)).await;
        assert!(matches!(outcome, RoundOutcome::Imported { records: 1, .. }));
    }

    #[tokio::test]
    async fn test_oversized_response_shrinks_page() {
        let source = MemorySource::new();
        let store = Arc::new(MemoryDocumentStore::new());
        source.fail_next(SourceErrorKind::PayloadTooLarge).await;
        let mut mediator = mediator(&source, &store, 8);

        mediator.run_round(at(0)).await;
        assert_eq!(mediator.page_size(), 4);
    }

    #[tokio::test]
    async fn test_malformed_record_abandons_round() {
        let source = MemorySource::new();
        let store = Arc::new(MemoryDocumentStore::new());
        source
            .push(
                EntityType::ProcessInstance,
                [SourceRecord::at_position("pi-x", 1, None, json!({"state": "ACTIVE"}))],
            )
            .await;
        let mut mediator = mediator(&source, &store, 5);

        let outcome = mediator.run_round(at(0)).await;
        assert!(matches!(outcome, RoundOutcome::Failed(RoundFailure::Transform(_))));
        assert_eq!(position(&mediator), 0);
        assert!(store.documents("process-instance-order").await.is_empty());
    }
}
