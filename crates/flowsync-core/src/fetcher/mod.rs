// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetchers: the next ordered page of an entity stream plus the cursor that
//! would follow it.
//!
//! The variant is chosen by the data source kind:
//!
//! | Variant | Source | Selection |
//! |---------|--------|-----------|
//! | [`TimestampFetcher`] | engine history | `(timestamp, id) > cursor`, minus the skew window |
//! | [`LogFetcher`] | exported log | `position > cursor` until a sequence is seen, `sequence > cursor` after, with periodic position scans to jump sequence gaps |

mod log;
mod timestamp;

pub use self::log::LogFetcher;
pub use self::timestamp::TimestampFetcher;

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::checkpoint::Cursor;
use crate::config::{DataSourceConfig, ImportConfig};
use crate::model::{EntityType, SourceRecord};
use crate::source::{SourceAdapter, SourceError};

/// How a page was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Engine cursor pagination.
    Timestamp,
    /// Log position pagination (initial mode, or a gap scan).
    Position,
    /// Log sequence pagination.
    Sequence,
}

/// One fetched page. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPage {
    /// Stream the page belongs to.
    pub entity_type: EntityType,
    /// Records to import, in stream order.
    pub records: Vec<SourceRecord>,
    /// Cursor following the last record of the page, including records that
    /// were fetched but dropped (excluded tenants).
    pub next_cursor: Cursor,
    /// Whether the stream has no more data right now.
    pub caught_up: bool,
    /// Selection used for this page.
    pub mode: FetchMode,
}

/// Settings shared by both fetcher variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherSettings {
    /// Timeout around each upstream call.
    pub timeout: Duration,
    /// Most recent upstream time excluded from timestamp pages.
    pub skew_window: Duration,
    /// Empty sequence rounds before one position scan.
    pub gap_scan_after_empty_rounds: u32,
    /// Clause limit for id lookups.
    pub max_clause_count: usize,
    /// Tenants whose records are dropped.
    pub excluded_tenants: Vec<String>,
}

impl FetcherSettings {
    /// Settings for one data source.
    pub fn from_config(import: &ImportConfig, source: &DataSourceConfig) -> Self {
        Self {
            timeout: import.fetch_timeout,
            skew_window: import.skew_window,
            gap_scan_after_empty_rounds: import.gap_scan_after_empty_rounds,
            max_clause_count: import.max_clause_count,
            excluded_tenants: source.excluded_tenants.clone(),
        }
    }
}

impl Default for FetcherSettings {
    fn default() -> Self {
        let import = ImportConfig::default();
        Self {
            timeout: import.fetch_timeout,
            skew_window: import.skew_window,
            gap_scan_after_empty_rounds: import.gap_scan_after_empty_rounds,
            max_clause_count: import.max_clause_count,
            excluded_tenants: Vec::new(),
        }
    }
}

/// Source-specific fetcher.
pub enum Fetcher {
    /// Engine history.
    Timestamp(TimestampFetcher),
    /// Exported log.
    Log(LogFetcher),
}

impl Fetcher {
    /// Build the fetcher matching the adapter.
    pub fn new(adapter: &SourceAdapter, entity_type: EntityType, settings: FetcherSettings) -> Self {
        match adapter {
            SourceAdapter::Timestamp(source) => {
                Fetcher::Timestamp(TimestampFetcher::new(source.clone(), entity_type, settings))
            }
            SourceAdapter::Log(source) => {
                Fetcher::Log(LogFetcher::new(source.clone(), entity_type, settings))
            }
        }
    }

    /// Fetch the page following `cursor`.
    pub async fn next_page(
        &mut self,
        cursor: &Cursor,
        page_size: usize,
        now: DateTime<Utc>,
    ) -> Result<FetchPage, SourceError> {
        match (self, cursor) {
            (Fetcher::Timestamp(fetcher), Cursor::Timestamp(cursor)) => {
                fetcher.next_page(cursor, page_size, now).await
            }
            (Fetcher::Log(fetcher), Cursor::Log(cursor)) => fetcher.next_page(cursor, page_size).await,
            (_, cursor) => Err(SourceError::fatal(format!(
                "fetcher cannot page a {} cursor",
                cursor.kind()
            ))),
        }
    }
}

/// Run an upstream call under a timeout; expiry is a transient failure.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::transient(format!(
            "upstream call timed out after {:?}",
            timeout
        ))),
    }
}

/// Drop records of excluded tenants.
pub(crate) fn drop_excluded(records: &mut Vec<SourceRecord>, excluded: &HashSet<String>) {
    if excluded.is_empty() {
        return;
    }
    records.retain(|r| r.tenant_id.as_ref().is_none_or(|t| !excluded.contains(t)));
}
