// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document store interface and backends.
//!
//! Documents live in named groups (one per logical index). Every document
//! carries an optimistic version; writes go through [`DocumentStore::bulk_upsert`]
//! and report a result per item so callers can tell exactly which documents
//! were committed.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryDocumentStore;
pub use self::sqlite::SqliteDocumentStore;

use std::cmp::Ordering;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Default maximum number of boolean clauses accepted in one search.
pub const DEFAULT_MAX_CLAUSE_COUNT: usize = 1024;

/// Errors raised by document store backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The query carries more boolean clauses than the backend accepts.
    #[error("query has {actual} clauses, backend limit is {limit}")]
    TooManyClauses {
        /// Clauses in the rejected query.
        actual: usize,
        /// Backend limit.
        limit: usize,
    },

    /// A write lost an optimistic concurrency race.
    #[error("version conflict on {group}/{id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Target group.
        group: String,
        /// Document id.
        id: String,
        /// Version the writer expected.
        expected: u64,
        /// Version found in the store.
        actual: u64,
    },

    /// A write targeted a group that was never created.
    #[error("document group '{0}' does not exist")]
    GroupNotFound(String),

    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failure while opening a store.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Document body could not be (de)serialized.
    #[error("invalid document body: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error while opening a store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store did not answer within the configured timeout.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Item-level rejection surfaced as a whole-call error.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Timeout(_) | Self::VersionConflict { .. }
        )
    }
}

/// A document as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Document id, unique within its group.
    pub id: String,
    /// Optimistic version, starting at 1.
    pub version: u64,
    /// JSON body.
    pub body: Value,
}

/// One item of a bulk upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    /// Target document id.
    pub id: String,
    /// `None` writes unconditionally, `Some(0)` requires the document to be
    /// absent, `Some(v)` requires the stored version to equal `v`.
    pub expected_version: Option<u64>,
    /// Full replacement body.
    pub body: Value,
}

impl DocumentWrite {
    /// Write regardless of the stored version.
    pub fn unconditional(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            expected_version: None,
            body,
        }
    }

    /// Create a document that must not exist yet.
    pub fn create(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            expected_version: Some(0),
            body,
        }
    }

    /// Replace a document read at `version`.
    pub fn replace(id: impl Into<String>, version: u64, body: Value) -> Self {
        Self {
            id: id.into(),
            expected_version: Some(version),
            body,
        }
    }
}

/// Per-item result of a bulk upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Committed at the given version.
    Written {
        /// New document version.
        version: u64,
    },
    /// The expected version did not match.
    Conflict {
        /// Version the writer expected.
        expected: u64,
        /// Version found in the store (0 when absent).
        actual: u64,
    },
    /// The backend refused the item.
    Rejected(String),
}

impl ItemOutcome {
    /// Whether the item was committed.
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    /// Human readable failure reason, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Written { .. } => None,
            Self::Conflict { expected, actual } => Some(format!(
                "version conflict: expected {}, found {}",
                expected, actual
            )),
            Self::Rejected(reason) => Some(reason.clone()),
        }
    }
}

/// Result for one item, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    /// Document id of the item.
    pub id: String,
    /// What happened to it.
    pub outcome: ItemOutcome,
}

/// Response of [`DocumentStore::bulk_upsert`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    /// One entry per requested write, in request order.
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    /// Whether every item was committed.
    pub fn all_written(&self) -> bool {
        self.items.iter().all(|item| item.outcome.is_written())
    }

    /// Turn the first failed item into an error for callers that need all-or-nothing.
    pub fn into_result(self, group: &str) -> Result<(), StoreError> {
        for item in self.items {
            match item.outcome {
                ItemOutcome::Written { .. } => {}
                ItemOutcome::Conflict { expected, actual } => {
                    return Err(StoreError::VersionConflict {
                        group: group.to_string(),
                        id: item.id,
                        expected,
                        actual,
                    });
                }
                ItemOutcome::Rejected(reason) => {
                    return Err(StoreError::Other(format!(
                        "write of {}/{} rejected: {}",
                        group, item.id, reason
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A search filter. Each value in a list counts as one boolean clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Document id is one of the given ids.
    Ids(Vec<String>),
    /// Body field equals one of the values (`null` matches a missing field).
    FieldIn {
        /// Top-level body field.
        field: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Body field equals none of the values; missing or null fields match.
    FieldNotIn {
        /// Top-level body field.
        field: String,
        /// Excluded values.
        values: Vec<Value>,
    },
    /// Body field equals a single value.
    FieldEquals {
        /// Top-level body field.
        field: String,
        /// Required value.
        value: Value,
    },
}

impl Filter {
    /// Boolean clauses this filter expands to in the backend.
    pub fn clause_count(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::FieldIn { values, .. } | Self::FieldNotIn { values, .. } => values.len(),
            Self::FieldEquals { .. } => 1,
        }
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &StoredDocument) -> bool {
        match self {
            Self::Ids(ids) => ids.iter().any(|id| *id == doc.id),
            Self::FieldIn { field, values } => {
                let actual = field_value(&doc.body, field);
                values.iter().any(|v| values_equal(actual, v))
            }
            Self::FieldNotIn { field, values } => {
                let actual = field_value(&doc.body, field);
                actual.is_null() || !values.iter().any(|v| values_equal(actual, v))
            }
            Self::FieldEquals { field, value } => values_equal(field_value(&doc.body, field), value),
        }
    }
}

/// Result ordering of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// Top-level body field.
    pub field: String,
    /// Descending when true.
    pub descending: bool,
}

/// A search against one document group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    /// Conjunction of filters.
    pub filters: Vec<Filter>,
    /// Sort order; results are ordered by id when absent.
    pub sort: Option<Sort>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl DocumentQuery {
    /// An unfiltered query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for the given document ids.
    pub fn by_ids(ids: Vec<String>) -> Self {
        Self::new().filter(Filter::Ids(ids))
    }

    /// Add a filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sort by a body field.
    pub fn sort_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            descending,
        });
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Total boolean clauses of the query.
    pub fn clause_count(&self) -> usize {
        self.filters.iter().map(Filter::clause_count).sum()
    }
}

/// Downstream document store.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Largest clause count a single search may carry.
    fn max_clause_count(&self) -> usize;

    /// Create a group if needed. Returns `true` when it was created by this call.
    async fn ensure_group(&self, group: &str) -> Result<bool, StoreError>;

    /// Whether the group exists.
    async fn group_exists(&self, group: &str) -> Result<bool, StoreError>;

    /// Names of all groups starting with `prefix`, sorted.
    async fn list_groups(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Search one group. A missing group yields no documents; a query above
    /// [`max_clause_count`](Self::max_clause_count) fails with
    /// [`StoreError::TooManyClauses`].
    async fn search(
        &self,
        group: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Apply writes to an existing group, reporting a result per item.
    async fn bulk_upsert(
        &self,
        group: &str,
        writes: Vec<DocumentWrite>,
    ) -> Result<BulkResponse, StoreError>;
}

pub(crate) fn check_clause_limit(query: &DocumentQuery, limit: usize) -> Result<(), StoreError> {
    let actual = query.clause_count();
    if actual > limit {
        return Err(StoreError::TooManyClauses { actual, limit });
    }
    Ok(())
}

/// Version after applying a write, or the failed outcome.
pub(crate) fn next_version(expected: Option<u64>, current: Option<u64>) -> Result<u64, ItemOutcome> {
    let actual = current.unwrap_or(0);
    match expected {
        Some(expected) if expected != actual => Err(ItemOutcome::Conflict { expected, actual }),
        _ => Ok(actual + 1),
    }
}

pub(crate) fn field_value<'a>(body: &'a Value, field: &str) -> &'a Value {
    body.get(field).unwrap_or(&Value::Null)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or_default()
                .total_cmp(&y.as_f64().unwrap_or_default()),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if type_rank(a) == type_rank(b) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Order documents by `sort` (ties and unsorted results by id).
pub(crate) fn sort_documents(docs: &mut [StoredDocument], sort: Option<&Sort>) {
    match sort {
        Some(sort) => docs.sort_by(|a, b| {
            let ord = compare_values(field_value(&a.body, &sort.field), field_value(&b.body, &sort.field));
            let ord = if sort.descending { ord.reverse() } else { ord };
            ord.then_with(|| a.id.cmp(&b.id))
        }),
        None => docs.sort_by(|a, b| a.id.cmp(&b.id)),
    }
}
