// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timestamp-cursor fetcher for engine sources.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::{FetchMode, FetchPage, FetcherSettings, drop_excluded, with_timeout};
use crate::checkpoint::{Cursor, TimestampCursor};
use crate::model::{EntityType, SourceRecord};
use crate::partition::PartitionedQueryExecutor;
use crate::source::{SourceError, TimestampSource};

/// Pages an engine stream by `(timestamp, id)`.
pub struct TimestampFetcher {
    source: Arc<dyn TimestampSource>,
    entity_type: EntityType,
    timeout: Duration,
    skew_window: Duration,
    excluded_tenants: HashSet<String>,
    executor: PartitionedQueryExecutor,
}

impl TimestampFetcher {
    /// Create a fetcher for one entity stream.
    pub fn new(
        source: Arc<dyn TimestampSource>,
        entity_type: EntityType,
        settings: FetcherSettings,
    ) -> Self {
        Self {
            source,
            entity_type,
            timeout: settings.timeout,
            skew_window: settings.skew_window,
            excluded_tenants: settings.excluded_tenants.into_iter().collect(),
            executor: PartitionedQueryExecutor::new(settings.max_clause_count),
        }
    }

    /// Fetch records beyond `cursor`, holding back the last `skew_window` of upstream time.
    pub async fn next_page(
        &mut self,
        cursor: &TimestampCursor,
        page_size: usize,
        now: DateTime<Utc>,
    ) -> Result<FetchPage, SourceError> {
        let fetched = with_timeout(
            self.timeout,
            self.source.fetch_by_cursor(self.entity_type, cursor, page_size),
        )
        .await?;
        let fetched_count = fetched.len();

        let mut records = Vec::with_capacity(fetched_count);
        for record in fetched {
            let Some(timestamp) = record.timestamp else {
                return Err(SourceError::fatal(format!(
                    "{} record '{}' has no timestamp",
                    self.entity_type, record.id
                )));
            };
            if cursor.is_before(timestamp, &record.id) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let horizon = match chrono::Duration::from_std(self.skew_window) {
            Ok(window) => now - window,
            Err(_) => now,
        };
        let visible = records
            .iter()
            .position(|r| r.timestamp.is_some_and(|ts| ts > horizon))
            .unwrap_or(records.len());
        let held_back = visible < records.len();
        records.truncate(visible);
        if held_back {
            debug!(
                entity_type = %self.entity_type,
                horizon = %horizon,
                "Holding back records inside the skew window"
            );
        }

        let next_cursor = cursor.advanced_by(&records);
        drop_excluded(&mut records, &self.excluded_tenants);

        if self.entity_type.needs_detail_lookup() && !records.is_empty() {
            self.attach_details(&mut records).await;
        }

        Ok(FetchPage {
            entity_type: self.entity_type,
            records,
            next_cursor: Cursor::Timestamp(next_cursor),
            caught_up: fetched_count < page_size || held_back,
            mode: FetchMode::Timestamp,
        })
    }

    /// Merge detail payloads into definition headers. Header fields win; a
    /// failed lookup keeps the headers as they are.
    async fn attach_details(&self, records: &mut [SourceRecord]) {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let lookup = with_timeout(
            self.timeout,
            self.executor.fetch_by_ids(self.source.as_ref(), self.entity_type, &ids),
        )
        .await;

        let details = match lookup {
            Ok(details) => details,
            Err(e) => {
                warn!(
                    entity_type = %self.entity_type,
                    definitions = ids.len(),
                    error = %e,
                    "Definition detail lookup failed, importing headers only"
                );
                return;
            }
        };

        let mut by_id: HashMap<String, Value> =
            details.into_iter().map(|d| (d.id, d.payload)).collect();
        for record in records.iter_mut() {
            let Some(Value::Object(detail)) = by_id.remove(&record.id) else {
                continue;
            };
            if let Value::Object(header) = &mut record.payload {
                for (key, value) in detail {
                    header.entry(key).or_insert(value);
                }
            } else if record.payload.is_null() {
                record.payload = Value::Object(detail);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, SourceErrorKind};
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn settings(skew_ms: u64) -> FetcherSettings {
        FetcherSettings {
            skew_window: Duration::from_millis(skew_ms),
            ..FetcherSettings::default()
        }
    }

    fn fetcher(source: &MemorySource, entity: EntityType, skew_ms: u64) -> TimestampFetcher {
        TimestampFetcher::new(Arc::new(source.clone()), entity, settings(skew_ms))
    }

    #[tokio::test]
    async fn test_short_page_is_caught_up() {
        let source = MemorySource::new();
        source
            .push(
                EntityType::ProcessInstance,
                [
                    SourceRecord::at_time("b", ts(1), json!({})),
                    SourceRecord::at_time("a", ts(1), json!({})),
                ],
            )
            .await;
        let mut fetcher = fetcher(&source, EntityType::ProcessInstance, 0);

        let page = fetcher
            .next_page(&TimestampCursor::default(), 10, ts(100))
            .await
            .unwrap();
        assert!(page.caught_up);
        assert_eq!(page.mode, FetchMode::Timestamp);
        assert_eq!(
            page.records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let Cursor::Timestamp(next) = page.next_cursor else {
            panic!("expected timestamp cursor");
        };
        assert_eq!(next.tie_break_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_skew_window_holds_back_recent_records() {
        let source = MemorySource::new();
        source
            .push(
                EntityType::ProcessInstance,
                [
                    SourceRecord::at_time("old", ts(0), json!({})),
                    SourceRecord::at_time("new", ts(9), json!({})),
                ],
            )
            .await;
        let mut fetcher = fetcher(&source, EntityType::ProcessInstance, 2000);

        let page = fetcher
            .next_page(&TimestampCursor::default(), 2, ts(10))
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "old");
        assert!(page.caught_up);

        let Cursor::Timestamp(next) = page.next_cursor else {
            panic!("expected timestamp cursor");
        };
        assert_eq!(next.timestamp, Some(ts(0)));
    }

    /// Source returning a record without timestamp, which `MemorySource` would filter out.
    struct Untimed;

    #[async_trait::async_trait]
    impl TimestampSource for Untimed {
        async fn fetch_by_cursor(
            &self,
            _: EntityType,
            _: &TimestampCursor,
            _: usize,
        ) -> Result<Vec<SourceRecord>, SourceError> {
            Ok(vec![SourceRecord::at_position("t1", 1, None, json!({}))])
        }

        async fn fetch_by_id(
            &self,
            _: EntityType,
            _: &[String],
        ) -> Result<Vec<SourceRecord>, SourceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_missing_timestamp_is_fatal() {
        let mut fetcher = TimestampFetcher::new(Arc::new(Untimed), EntityType::Tenant, settings(0));

        let err = fetcher
            .next_page(&TimestampCursor::default(), 10, ts(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_excluded_tenants_still_advance_cursor() {
        let source = MemorySource::new();
        source
            .push(
                EntityType::UserTask,
                [
                    SourceRecord::at_time("u1", ts(1), json!({})).with_tenant("keep"),
                    SourceRecord::at_time("u2", ts(2), json!({})).with_tenant("drop"),
                ],
            )
            .await;
        let mut fetcher = TimestampFetcher::new(
            Arc::new(source.clone()),
            EntityType::UserTask,
            FetcherSettings {
                skew_window: Duration::ZERO,
                excluded_tenants: vec!["drop".into()],
                ..FetcherSettings::default()
            },
        );

        let page = fetcher
            .next_page(&TimestampCursor::default(), 10, ts(100))
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        let Cursor::Timestamp(next) = page.next_cursor else {
            panic!("expected timestamp cursor");
        };
        assert_eq!(next.timestamp, Some(ts(2)));
    }

    #[tokio::test]
    async fn test_definition_details_attached_and_failure_tolerated() {
        let source = MemorySource::new();
        source
            .push(
                EntityType::ProcessDefinition,
                [SourceRecord::at_time(
                    "d1",
                    ts(1),
                    json!({"key": "order", "name": "Header name"}),
                )],
            )
            .await;
        source
            .put_details(
                EntityType::ProcessDefinition,
                [SourceRecord::at_time(
                    "d1",
                    ts(1),
                    json!({"xml": "<bpmn/>", "name": "Detail name"}),
                )],
            )
            .await;
        let mut fetcher = fetcher(&source, EntityType::ProcessDefinition, 0);

        let page = fetcher
            .next_page(&TimestampCursor::default(), 10, ts(100))
            .await
            .unwrap();
        assert_eq!(page.records[0].payload["xml"], "<bpmn/>");
        assert_eq!(page.records[0].payload["name"], "Header name");

        source.fail_detail_lookups(1).await;
        let page = fetcher
            .next_page(&TimestampCursor::default(), 10, ts(100))
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.records[0].payload.get("xml").is_none());
    }
}
