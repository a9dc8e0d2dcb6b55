// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Position/sequence fetcher for exported event logs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{FetchMode, FetchPage, FetcherSettings, drop_excluded, with_timeout};
use crate::checkpoint::{Cursor, LogCursor};
use crate::model::EntityType;
use crate::source::{LogQuery, LogSource, SourceError};

/// Pages a log stream by position, then by sequence once one was seen.
///
/// Sequence ranges can contain gaps larger than a page. After
/// `gap_scan_after_empty_rounds` consecutive empty sequence rounds one round
/// is fetched by position instead, which finds the records past the gap.
pub struct LogFetcher {
    source: Arc<dyn LogSource>,
    entity_type: EntityType,
    timeout: Duration,
    gap_scan_after_empty_rounds: u32,
    empty_sequence_rounds: u32,
    excluded_tenants: HashSet<String>,
}

impl LogFetcher {
    /// Create a fetcher for one entity stream.
    pub fn new(source: Arc<dyn LogSource>, entity_type: EntityType, settings: FetcherSettings) -> Self {
        Self {
            source,
            entity_type,
            timeout: settings.timeout,
            gap_scan_after_empty_rounds: settings.gap_scan_after_empty_rounds,
            empty_sequence_rounds: 0,
            excluded_tenants: settings.excluded_tenants.into_iter().collect(),
        }
    }

    /// Consecutive empty sequence rounds since the last data or scan.
    pub fn empty_sequence_rounds(&self) -> u32 {
        self.empty_sequence_rounds
    }

    fn query_for(&self, cursor: &LogCursor, page_size: usize) -> (LogQuery, FetchMode) {
        if !cursor.has_seen_sequence || self.empty_sequence_rounds >= self.gap_scan_after_empty_rounds
        {
            return (LogQuery::AfterPosition(cursor.position), FetchMode::Position);
        }
        let span = i64::try_from(page_size).unwrap_or(i64::MAX);
        (
            LogQuery::SequenceRange {
                after: cursor.sequence,
                up_to: cursor.sequence.saturating_add(span),
            },
            FetchMode::Sequence,
        )
    }

    /// Fetch the page following `cursor`.
    pub async fn next_page(
        &mut self,
        cursor: &LogCursor,
        page_size: usize,
    ) -> Result<FetchPage, SourceError> {
        let (query, mode) = self.query_for(cursor, page_size);
        let probing = mode == FetchMode::Position && cursor.has_seen_sequence;
        if probing {
            info!(
                entity_type = %self.entity_type,
                position = cursor.position,
                sequence = cursor.sequence,
                empty_rounds = self.empty_sequence_rounds,
                "Probing log by position for a sequence gap"
            );
        }

        let fetched = with_timeout(
            self.timeout,
            self.source
                .fetch_by_position_or_sequence(self.entity_type, query, page_size),
        )
        .await?;
        let fetched_count = fetched.len();

        let mut records = Vec::with_capacity(fetched_count);
        for record in fetched {
            let keep = match mode {
                FetchMode::Sequence => match record.sequence {
                    Some(sequence) => sequence > cursor.sequence,
                    None => {
                        return Err(SourceError::fatal(format!(
                            "{} record '{}' has no sequence",
                            self.entity_type, record.id
                        )));
                    }
                },
                _ => match record.position {
                    Some(position) => position > cursor.position,
                    None => {
                        return Err(SourceError::fatal(format!(
                            "{} record '{}' has no position",
                            self.entity_type, record.id
                        )));
                    }
                },
            };
            if keep {
                records.push(record);
            }
        }
        match mode {
            FetchMode::Sequence => records.sort_by_key(|r| r.sequence),
            _ => records.sort_by_key(|r| r.position),
        }

        if probing {
            self.empty_sequence_rounds = 0;
            if let Some(first) = records.iter().find_map(|r| r.sequence)
                && first > cursor.sequence + 1
            {
                info!(
                    entity_type = %self.entity_type,
                    from = cursor.sequence,
                    to = first,
                    "Jumping sequence gap"
                );
            }
        } else if mode == FetchMode::Sequence {
            if fetched_count == 0 {
                self.empty_sequence_rounds += 1;
                debug!(
                    entity_type = %self.entity_type,
                    empty_rounds = self.empty_sequence_rounds,
                    "Empty sequence round"
                );
            } else {
                self.empty_sequence_rounds = 0;
            }
        }

        let next_cursor = cursor.advanced_by(&records);
        drop_excluded(&mut records, &self.excluded_tenants);

        Ok(FetchPage {
            entity_type: self.entity_type,
            records,
            next_cursor: Cursor::Log(next_cursor),
            caught_up: fetched_count < page_size,
            mode,
        })
    }
}
