// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File-backed source used by the importer binary.
//!
//! A data source directory holds one `<entity>.jsonl` file per entity type
//! (one JSON [`SourceRecord`] per line) and, for definitions, an optional
//! `<entity>.details.jsonl` file served by `fetch_by_id`. Files are re-read on
//! every call so appended lines are picked up by the next round.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{
    LogQuery, LogSource, SourceError, TimestampSource, select_by_cursor, select_by_ids,
    select_by_log_query,
};
use crate::checkpoint::TimestampCursor;
use crate::model::{EntityType, SourceRecord};

/// Source reading JSON lines exports from a directory.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    /// Serve the exports under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn records_path(&self, entity_type: EntityType) -> PathBuf {
        self.root.join(format!("{}.jsonl", entity_type))
    }

    fn details_path(&self, entity_type: EntityType) -> PathBuf {
        self.root.join(format!("{}.details.jsonl", entity_type))
    }

    async fn read(path: &Path) -> Result<Vec<SourceRecord>, SourceError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SourceError::transient(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str::<SourceRecord>(line).map_err(|e| {
                    SourceError::fatal(format!("{}:{}: {}", path.display(), n + 1, e))
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl TimestampSource for FileSource {
    async fn fetch_by_cursor(
        &self,
        entity_type: EntityType,
        cursor: &TimestampCursor,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let records = Self::read(&self.records_path(entity_type)).await?;
        Ok(select_by_cursor(&records, cursor, page_size))
    }

    async fn fetch_by_id(
        &self,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let records = Self::read(&self.details_path(entity_type)).await?;
        Ok(select_by_ids(&records, ids))
    }
}

#[async_trait::async_trait]
impl LogSource for FileSource {
    async fn fetch_by_position_or_sequence(
        &self,
        entity_type: EntityType,
        query: LogQuery,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let records = Self::read(&self.records_path(entity_type)).await?;
        Ok(select_by_log_query(&records, query, page_size))
    }
}
