// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Import checkpoints and their cursors.
//!
//! A [`Checkpoint`] tracks how far one `(data source, entity type)` stream has
//! been imported. It holds two cursors:
//!
//! - the **persisted** cursor, which only moves after the merge writer has
//!   confirmed every fragment of a page, and
//! - the **pending** cursor, proposed from the most recent fetch and
//!   discarded if the round fails.
//!
//! ```text
//!            propose_advance(page)            confirm(candidate)
//!   persisted ─────────────────────► pending ────────────────────► persisted'
//!       ▲                               │
//!       └──────── discard_pending ──────┘   (fetch/transform/write failure)
//! ```
//!
//! Cursor ordering depends on the source:
//!
//! | Cursor | Ordering |
//! |--------|----------|
//! | [`TimestampCursor`] | `(timestamp, id)`; ids already seen at the cursor timestamp are kept as tie-breakers |
//! | [`LogCursor`] | position until the first sequence is seen, sequence afterwards |

pub mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DataSourceId, EntityType, SourceKind, SourceRecord};

pub use self::store::{CHECKPOINT_GROUP, CheckpointStore};

/// Errors raised by cursor bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CheckpointError {
    /// A candidate cursor would move the checkpoint backwards.
    #[error("cursor for {data_source}/{entity_type} would move backwards")]
    Regression {
        /// Data source of the checkpoint.
        data_source: String,
        /// Entity type of the checkpoint.
        entity_type: EntityType,
    },

    /// A cursor of the wrong variant was offered or loaded.
    #[error("cursor kind mismatch: checkpoint is {expected}, got {actual}")]
    KindMismatch {
        /// Variant the checkpoint was created with.
        expected: SourceKind,
        /// Variant that was offered.
        actual: SourceKind,
    },

    /// `confirm` was called without a pending cursor.
    #[error("no pending cursor to confirm")]
    NothingPending,

    /// `confirm` was called with a cursor other than the pending one.
    #[error("confirmed cursor does not match the pending cursor")]
    PendingMismatch,
}

/// Cursor of an engine stream: the last imported timestamp plus the ids
/// already imported at exactly that timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampCursor {
    /// Timestamp of the last imported record, `None` before the first import.
    pub timestamp: Option<DateTime<Utc>>,
    /// Sorted ids of records already imported at `timestamp`.
    #[serde(default)]
    pub tie_break_ids: Vec<String>,
}

impl TimestampCursor {
    /// Whether a record at `(timestamp, id)` lies beyond this cursor.
    pub fn is_before(&self, timestamp: DateTime<Utc>, id: &str) -> bool {
        match self.timestamp {
            None => true,
            Some(current) if timestamp > current => true,
            Some(current) if timestamp == current => self
                .tie_break_ids
                .binary_search_by(|entry| entry.as_str().cmp(id))
                .is_err(),
            Some(_) => false,
        }
    }

    /// The cursor that follows `records`, which must be ordered by `(timestamp, id)`.
    ///
    /// Records without a timestamp are ignored.
    pub fn advanced_by(&self, records: &[SourceRecord]) -> TimestampCursor {
        let Some(last) = records.iter().rev().find_map(|r| r.timestamp) else {
            return self.clone();
        };
        if self.timestamp.is_some_and(|current| current > last) {
            return self.clone();
        }

        let mut tie_break_ids: Vec<String> = if self.timestamp == Some(last) {
            self.tie_break_ids.clone()
        } else {
            Vec::new()
        };
        tie_break_ids.extend(
            records
                .iter()
                .filter(|r| r.timestamp == Some(last))
                .map(|r| r.id.clone()),
        );
        tie_break_ids.sort();
        tie_break_ids.dedup();

        TimestampCursor {
            timestamp: Some(last),
            tie_break_ids,
        }
    }

    /// Whether this cursor is at or beyond `other`.
    pub fn covers(&self, other: &TimestampCursor) -> bool {
        match (self.timestamp, other.timestamp) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(mine), Some(theirs)) if mine > theirs => true,
            (Some(mine), Some(theirs)) if mine == theirs => other
                .tie_break_ids
                .iter()
                .all(|id| self.tie_break_ids.binary_search(id).is_ok()),
            _ => false,
        }
    }
}

/// Cursor of a log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCursor {
    /// Highest imported log position.
    pub position: i64,
    /// Highest imported sequence (meaningful once `has_seen_sequence`).
    pub sequence: i64,
    /// Set once any imported record carried a sequence; never reset except by `reset()`.
    pub has_seen_sequence: bool,
}

impl LogCursor {
    /// Whether a record lies beyond this cursor under the authoritative ordering.
    pub fn is_before(&self, record: &SourceRecord) -> bool {
        match (self.has_seen_sequence, record.sequence) {
            (true, Some(sequence)) => sequence > self.sequence,
            _ => record.position.is_some_and(|p| p > self.position),
        }
    }

    /// The cursor that follows `records`.
    pub fn advanced_by(&self, records: &[SourceRecord]) -> LogCursor {
        let mut next = *self;
        for record in records {
            if let Some(position) = record.position {
                next.position = next.position.max(position);
            }
            if let Some(sequence) = record.sequence {
                next.sequence = next.sequence.max(sequence);
                next.has_seen_sequence = true;
            }
        }
        next
    }

    /// Whether this cursor is at or beyond `other`.
    pub fn covers(&self, other: &LogCursor) -> bool {
        self.position >= other.position
            && self.sequence >= other.sequence
            && (self.has_seen_sequence || !other.has_seen_sequence)
    }
}

/// Source-specific cursor variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cursor {
    /// Engine sources.
    Timestamp(TimestampCursor),
    /// Log sources.
    Log(LogCursor),
}

impl Cursor {
    /// The zero cursor for a source kind.
    pub fn zero(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Engine => Cursor::Timestamp(TimestampCursor::default()),
            SourceKind::Log => Cursor::Log(LogCursor::default()),
        }
    }

    /// Source kind this cursor belongs to.
    pub fn kind(&self) -> SourceKind {
        match self {
            Cursor::Timestamp(_) => SourceKind::Engine,
            Cursor::Log(_) => SourceKind::Log,
        }
    }

    /// Whether this cursor is at or beyond `other`. Cursors of different kinds never cover each other.
    pub fn covers(&self, other: &Cursor) -> bool {
        match (self, other) {
            (Cursor::Timestamp(a), Cursor::Timestamp(b)) => a.covers(b),
            (Cursor::Log(a), Cursor::Log(b)) => a.covers(b),
            _ => false,
        }
    }

    /// Whether this is the zero cursor of its kind.
    pub fn is_zero(&self) -> bool {
        *self == Cursor::zero(self.kind())
    }
}

/// Serialized form of a checkpoint, stored as a document in [`CHECKPOINT_GROUP`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    /// Owning data source.
    pub data_source_id: String,
    /// Imported entity type.
    pub entity_type: EntityType,
    /// Last confirmed cursor.
    pub persisted_cursor: Cursor,
    /// Incremented on every confirm or reset.
    pub revision: u64,
    /// Last fetch attempt.
    #[serde(default)]
    pub last_round_at: Option<DateTime<Utc>>,
}

/// Progress of one `(data source, entity type)` stream.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    data_source_id: DataSourceId,
    entity_type: EntityType,
    persisted: Cursor,
    pending: Option<Cursor>,
    revision: u64,
    last_round_at: Option<DateTime<Utc>>,
    backoff: Duration,
    dirty: bool,
}

impl Checkpoint {
    /// A checkpoint at the start of the stream.
    pub fn zero(data_source_id: DataSourceId, entity_type: EntityType, kind: SourceKind) -> Self {
        Self {
            data_source_id,
            entity_type,
            persisted: Cursor::zero(kind),
            pending: None,
            revision: 0,
            last_round_at: None,
            backoff: Duration::ZERO,
            dirty: false,
        }
    }

    /// Rebuild a checkpoint from its stored record.
    pub fn from_record(record: CheckpointRecord, kind: SourceKind) -> Result<Self, CheckpointError> {
        if record.persisted_cursor.kind() != kind {
            return Err(CheckpointError::KindMismatch {
                expected: kind,
                actual: record.persisted_cursor.kind(),
            });
        }
        Ok(Self {
            data_source_id: DataSourceId::new(record.data_source_id),
            entity_type: record.entity_type,
            persisted: record.persisted_cursor,
            pending: None,
            revision: record.revision,
            last_round_at: record.last_round_at,
            backoff: Duration::ZERO,
            dirty: false,
        })
    }

    /// Stored form of the persisted state.
    pub fn to_record(&self) -> CheckpointRecord {
        CheckpointRecord {
            data_source_id: self.data_source_id.0.clone(),
            entity_type: self.entity_type,
            persisted_cursor: self.persisted.clone(),
            revision: self.revision,
            last_round_at: self.last_round_at,
        }
    }

    /// Owning data source.
    pub fn data_source_id(&self) -> &DataSourceId {
        &self.data_source_id
    }

    /// Imported entity type.
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Source kind of the cursor.
    pub fn kind(&self) -> SourceKind {
        self.persisted.kind()
    }

    /// Last confirmed cursor.
    pub fn persisted_cursor(&self) -> &Cursor {
        &self.persisted
    }

    /// Cursor proposed by the in-flight round, if any.
    pub fn pending_cursor(&self) -> Option<&Cursor> {
        self.pending.as_ref()
    }

    /// Confirm/reset counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Wall-clock time of the last fetch attempt.
    pub fn last_round_at(&self) -> Option<DateTime<Utc>> {
        self.last_round_at
    }

    /// Current delay before the next round is due.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Whether confirmed progress has not been flushed to the store yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record a fetch attempt and the delay before the next one.
    pub fn record_round(&mut self, at: DateTime<Utc>, backoff: Duration) {
        self.last_round_at = Some(at);
        self.backoff = backoff;
    }

    /// Whether enough time has passed since the last round.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_round_at else {
            return true;
        };
        match chrono::Duration::from_std(self.backoff) {
            Ok(backoff) => now >= last + backoff,
            Err(_) => false,
        }
    }

    /// Remember `candidate` as the pending cursor of the current round.
    ///
    /// Fails if the candidate would move the checkpoint backwards.
    pub fn propose_advance(&mut self, candidate: Cursor) -> Result<Cursor, CheckpointError> {
        if candidate.kind() != self.kind() {
            return Err(CheckpointError::KindMismatch {
                expected: self.kind(),
                actual: candidate.kind(),
            });
        }
        if !candidate.covers(&self.persisted) {
            return Err(CheckpointError::Regression {
                data_source: self.data_source_id.0.clone(),
                entity_type: self.entity_type,
            });
        }
        self.pending = Some(candidate.clone());
        Ok(candidate)
    }

    /// Promote the pending cursor after the merge writer confirmed the page.
    pub fn confirm(&mut self, candidate: &Cursor) -> Result<(), CheckpointError> {
        match &self.pending {
            None => return Err(CheckpointError::NothingPending),
            Some(pending) if pending != candidate => return Err(CheckpointError::PendingMismatch),
            Some(_) => {}
        }
        if *candidate != self.persisted {
            self.persisted = candidate.clone();
            self.revision += 1;
            self.dirty = true;
        }
        self.pending = None;
        Ok(())
    }

    /// Drop the pending cursor of a failed round.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Return to the start of the stream, forcing a full re-import.
    pub fn reset(&mut self) {
        self.persisted = Cursor::zero(self.kind());
        self.pending = None;
        self.revision += 1;
        self.last_round_at = None;
        self.backoff = Duration::ZERO;
        self.dirty = true;
    }

    /// Mark the persisted cursor as flushed to the store.
    pub fn mark_flushed(&mut self) {
        self.dirty = false;
    }
}
