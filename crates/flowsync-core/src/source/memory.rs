// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory source implementing both adapter traits.
//!
//! Records are pushed per entity type. Failures can be queued so the next
//! calls fail with a chosen [`SourceErrorKind`], and every request is
//! recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{
    LogQuery, LogSource, SourceError, SourceErrorKind, TimestampSource, select_by_cursor,
    select_by_ids, select_by_log_query,
};
use crate::checkpoint::TimestampCursor;
use crate::model::{EntityType, SourceRecord};

/// A request received by [`MemorySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedRequest {
    /// `fetch_by_cursor` call.
    Cursor {
        /// Requested stream.
        entity_type: EntityType,
        /// Page size.
        page_size: usize,
    },
    /// `fetch_by_id` call.
    Ids {
        /// Requested stream.
        entity_type: EntityType,
        /// Number of ids.
        count: usize,
    },
    /// `fetch_by_position_or_sequence` call.
    Log {
        /// Requested stream.
        entity_type: EntityType,
        /// Selection.
        query: LogQuery,
        /// Page size.
        page_size: usize,
    },
}

#[derive(Default)]
struct State {
    records: HashMap<EntityType, Vec<SourceRecord>>,
    details: HashMap<EntityType, Vec<SourceRecord>>,
    failures: VecDeque<SourceErrorKind>,
    detail_failures: usize,
    requests: Vec<RecordedRequest>,
}

/// Upstream double backed by vectors.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records to an entity stream.
    pub async fn push(&self, entity_type: EntityType, records: impl IntoIterator<Item = SourceRecord>) {
        self.state
            .lock()
            .await
            .records
            .entry(entity_type)
            .or_default()
            .extend(records);
    }

    /// Register detail records served by `fetch_by_id`.
    pub async fn put_details(
        &self,
        entity_type: EntityType,
        records: impl IntoIterator<Item = SourceRecord>,
    ) {
        self.state
            .lock()
            .await
            .details
            .entry(entity_type)
            .or_default()
            .extend(records);
    }

    /// Fail the next paged fetch with `kind`. Calls queue up.
    pub async fn fail_next(&self, kind: SourceErrorKind) {
        self.state.lock().await.failures.push_back(kind);
    }

    /// Fail the next `count` detail lookups.
    pub async fn fail_detail_lookups(&self, count: usize) {
        self.state.lock().await.detail_failures = count;
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().await.requests.clone()
    }

    fn take_failure(state: &mut State) -> Result<(), SourceError> {
        match state.failures.pop_front() {
            Some(kind) => Err(SourceError::new(kind, "injected failure")),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl TimestampSource for MemorySource {
    async fn fetch_by_cursor(
        &self,
        entity_type: EntityType,
        cursor: &TimestampCursor,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let mut state = self.state.lock().await;
        state.requests.push(RecordedRequest::Cursor {
            entity_type,
            page_size,
        });
        Self::take_failure(&mut state)?;

        let records = state.records.get(&entity_type).map(Vec::as_slice).unwrap_or_default();
        Ok(select_by_cursor(records, cursor, page_size))
    }

    async fn fetch_by_id(
        &self,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let mut state = self.state.lock().await;
        state.requests.push(RecordedRequest::Ids {
            entity_type,
            count: ids.len(),
        });
        if state.detail_failures > 0 {
            state.detail_failures -= 1;
            return Err(SourceError::transient("injected detail failure"));
        }

        let records = state.details.get(&entity_type).map(Vec::as_slice).unwrap_or_default();
        Ok(select_by_ids(records, ids))
    }
}

#[async_trait::async_trait]
impl LogSource for MemorySource {
    async fn fetch_by_position_or_sequence(
        &self,
        entity_type: EntityType,
        query: LogQuery,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let mut state = self.state.lock().await;
        state.requests.push(RecordedRequest::Log {
            entity_type,
            query,
            page_size,
        });
        Self::take_failure(&mut state)?;

        let records = state.records.get(&entity_type).map(Vec::as_slice).unwrap_or_default();
        Ok(select_by_log_query(records, query, page_size))
    }
}
