// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upstream source adapters.
//!
//! Transport, authentication and status classification live behind these
//! traits. The fetcher only sees a page of records or a classified
//! [`SourceError`].

pub mod file;
pub mod memory;

pub use self::file::FileSource;
pub use self::memory::MemorySource;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::checkpoint::TimestampCursor;
use crate::model::{EntityType, SourceKind, SourceRecord};

/// Classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceErrorKind {
    /// Network hiccup, timeout or 5xx; retried next round.
    Transient,
    /// Credentials rejected; logged distinctly and retried.
    Unauthorized,
    /// The response could not be used; the round is abandoned.
    Fatal,
    /// The response exceeded the transport limit; the page size shrinks.
    PayloadTooLarge,
}

impl SourceErrorKind {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient => "SOURCE_TRANSIENT",
            Self::Unauthorized => "SOURCE_UNAUTHORIZED",
            Self::Fatal => "SOURCE_FATAL",
            Self::PayloadTooLarge => "SOURCE_PAYLOAD_TOO_LARGE",
        }
    }
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Unauthorized => "unauthorized",
            Self::Fatal => "fatal",
            Self::PayloadTooLarge => "payload too large",
        })
    }
}

/// A classified upstream failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} source failure: {message}")]
pub struct SourceError {
    /// Failure class.
    pub kind: SourceErrorKind,
    /// Detail for logs.
    pub message: String,
}

impl SourceError {
    /// Create an error of the given kind.
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Transient, message)
    }

    /// An authorization failure.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Unauthorized, message)
    }

    /// A fatal failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Fatal, message)
    }

    /// An oversized response.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::PayloadTooLarge, message)
    }

    /// Whether the same request may succeed unchanged next round.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SourceErrorKind::Transient | SourceErrorKind::Unauthorized
        )
    }
}

/// Selection of a log fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogQuery {
    /// Records with `position > after`, ordered by position.
    AfterPosition(i64),
    /// Records with `after < sequence <= up_to`, ordered by sequence.
    SequenceRange {
        /// Exclusive lower bound.
        after: i64,
        /// Inclusive upper bound.
        up_to: i64,
    },
}

/// Engine history paged by timestamp.
#[async_trait::async_trait]
pub trait TimestampSource: Send + Sync {
    /// Records beyond `cursor`, ordered by `(timestamp, id)`, at most `page_size`.
    async fn fetch_by_cursor(
        &self,
        entity_type: EntityType,
        cursor: &TimestampCursor,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    /// Records with the given ids, in any order. Unknown ids are skipped.
    async fn fetch_by_id(
        &self,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<SourceRecord>, SourceError>;
}

/// Exported event log addressed by position and sequence.
#[async_trait::async_trait]
pub trait LogSource: Send + Sync {
    /// Records selected by `query`, at most `page_size`.
    async fn fetch_by_position_or_sequence(
        &self,
        entity_type: EntityType,
        query: LogQuery,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError>;
}

/// A configured source, selected by [`SourceKind`].
#[derive(Clone)]
pub enum SourceAdapter {
    /// Engine history.
    Timestamp(Arc<dyn TimestampSource>),
    /// Exported log.
    Log(Arc<dyn LogSource>),
}

impl SourceAdapter {
    /// Kind of the wrapped source.
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Timestamp(_) => SourceKind::Engine,
            Self::Log(_) => SourceKind::Log,
        }
    }
}

/// Apply a timestamp selection to an in-memory record set.
pub(crate) fn select_by_cursor(
    records: &[SourceRecord],
    cursor: &TimestampCursor,
    page_size: usize,
) -> Vec<SourceRecord> {
    let mut selected: Vec<SourceRecord> = records
        .iter()
        .filter(|r| match r.timestamp {
            Some(ts) => cursor.is_before(ts, &r.id),
            None => false,
        })
        .cloned()
        .collect();
    selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    selected.truncate(page_size);
    selected
}

/// Apply a log selection to an in-memory record set.
pub(crate) fn select_by_log_query(
    records: &[SourceRecord],
    query: LogQuery,
    page_size: usize,
) -> Vec<SourceRecord> {
    let mut selected: Vec<SourceRecord> = match query {
        LogQuery::AfterPosition(after) => {
            let mut selected: Vec<SourceRecord> = records
                .iter()
                .filter(|r| r.position.is_some_and(|p| p > after))
                .cloned()
                .collect();
            selected.sort_by_key(|r| r.position);
            selected
        }
        LogQuery::SequenceRange { after, up_to } => {
            let mut selected: Vec<SourceRecord> = records
                .iter()
                .filter(|r| r.sequence.is_some_and(|s| s > after && s <= up_to))
                .cloned()
                .collect();
            selected.sort_by_key(|r| r.sequence);
            selected
        }
    };
    selected.truncate(page_size);
    selected
}

/// Records whose id is in `ids`.
pub(crate) fn select_by_ids(records: &[SourceRecord], ids: &[String]) -> Vec<SourceRecord> {
    records
        .iter()
        .filter(|r| ids.iter().any(|id| *id == r.id))
        .cloned()
        .collect()
}
