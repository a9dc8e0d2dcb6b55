// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partitioned query execution.
//!
//! Backends cap the number of boolean clauses per query. Queries above the cap
//! are split along their largest list filter into sub-queries that fit, run
//! one after another and recombined:
//!
//! | Split filter | Recombination | Child limit |
//! |--------------|---------------|-------------|
//! | `Ids`, `FieldIn` | union | kept (each chunk's top N contains the global top N) |
//! | `FieldNotIn` | intersection | dropped |
//!
//! The caller's sort and limit are applied to the recombined result, so a
//! partitioned query returns exactly what the unsplit query would.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::debug;

use crate::model::{EntityType, SourceRecord};
use crate::persistence::{
    DocumentQuery, DocumentStore, Filter, StoreError, StoredDocument, sort_documents,
};
use crate::source::{SourceError, TimestampSource};

/// How a query will be executed.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Run as-is.
    Single(DocumentQuery),
    /// Run every child and union the results.
    Union(Vec<QueryPlan>),
    /// Run every child and keep documents present in all results.
    Intersection(Vec<QueryPlan>),
}

impl QueryPlan {
    /// Number of store searches this plan issues.
    pub fn search_count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Union(children) | Self::Intersection(children) => {
                children.iter().map(QueryPlan::search_count).sum()
            }
        }
    }
}

type SearchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<StoredDocument>, StoreError>> + Send + 'a>>;

/// Splits oversized queries to respect a backend clause limit.
#[derive(Debug, Clone, Copy)]
pub struct PartitionedQueryExecutor {
    max_clause_count: usize,
}

impl PartitionedQueryExecutor {
    /// Create an executor for the given clause limit (at least 1).
    pub fn new(max_clause_count: usize) -> Self {
        Self {
            max_clause_count: max_clause_count.max(1),
        }
    }

    /// Clause limit the executor plans for.
    pub fn max_clause_count(&self) -> usize {
        self.max_clause_count
    }

    /// A filter excluding `values` of `field`, or `None` when nothing is excluded.
    pub fn exclusion_filter(field: &str, values: &[String]) -> Option<Filter> {
        if values.is_empty() {
            return None;
        }
        Some(Filter::FieldNotIn {
            field: field.to_string(),
            values: values.iter().cloned().map(Value::String).collect(),
        })
    }

    /// Plan the execution of `query`.
    ///
    /// Queries whose fixed clauses alone exceed the limit are returned as
    /// [`QueryPlan::Single`] and fail in the store.
    pub fn plan(&self, query: &DocumentQuery) -> QueryPlan {
        let total = query.clause_count();
        if total <= self.max_clause_count {
            return QueryPlan::Single(query.clone());
        }

        let splittable: Vec<usize> = query
            .filters
            .iter()
            .enumerate()
            .filter(|(_, f)| !matches!(f, Filter::FieldEquals { .. }) && f.clause_count() > 1)
            .map(|(i, _)| i)
            .collect();
        let Some(&target) = splittable
            .iter()
            .max_by_key(|&&i| (query.filters[i].clause_count(), std::cmp::Reverse(i)))
        else {
            return QueryPlan::Single(query.clone());
        };

        let count = query.filters[target].clause_count();
        let others = total - count;
        let chunk = if others < self.max_clause_count {
            self.max_clause_count - others
        } else {
            (self.max_clause_count / splittable.len()).max(1)
        };
        if chunk >= count {
            return QueryPlan::Single(query.clone());
        }

        let excluding = matches!(query.filters[target], Filter::FieldNotIn { .. });
        let children = split_filter(&query.filters[target], chunk)
            .into_iter()
            .map(|filter| {
                let mut child = query.clone();
                child.filters[target] = filter;
                if excluding {
                    child.limit = None;
                }
                self.plan(&child)
            })
            .collect();

        if excluding {
            QueryPlan::Intersection(children)
        } else {
            QueryPlan::Union(children)
        }
    }

    /// Run `query` against `group`, partitioning it when needed.
    pub async fn execute(
        &self,
        store: &dyn DocumentStore,
        group: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let plan = self.plan(query);
        if let QueryPlan::Single(single) = &plan {
            return store.search(group, single).await;
        }

        debug!(
            group = %group,
            clauses = query.clause_count(),
            searches = plan.search_count(),
            "Partitioning query"
        );

        let mut docs = run_plan(store, group, &plan).await?;
        sort_documents(&mut docs, query.sort.as_ref());
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    /// Load documents by id, partitioning long id lists.
    pub async fn search_by_ids(
        &self,
        store: &dyn DocumentStore,
        group: &str,
        ids: Vec<String>,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.execute(store, group, &DocumentQuery::by_ids(ids)).await
    }

    /// Fetch upstream records by id in chunks of at most the clause limit.
    ///
    /// Results keep upstream order chunk by chunk; duplicate ids are dropped.
    pub async fn fetch_by_ids(
        &self,
        source: &dyn TimestampSource,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for chunk in ids.chunks(self.max_clause_count) {
            for record in source.fetch_by_id(entity_type, chunk).await? {
                if seen.insert(record.id.clone()) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

fn split_filter(filter: &Filter, chunk: usize) -> Vec<Filter> {
    match filter {
        Filter::Ids(ids) => ids.chunks(chunk).map(|c| Filter::Ids(c.to_vec())).collect(),
        Filter::FieldIn { field, values } => values
            .chunks(chunk)
            .map(|c| Filter::FieldIn {
                field: field.clone(),
                values: c.to_vec(),
            })
            .collect(),
        Filter::FieldNotIn { field, values } => values
            .chunks(chunk)
            .map(|c| Filter::FieldNotIn {
                field: field.clone(),
                values: c.to_vec(),
            })
            .collect(),
        Filter::FieldEquals { .. } => vec![filter.clone()],
    }
}

fn run_plan<'a>(store: &'a dyn DocumentStore, group: &'a str, plan: &'a QueryPlan) -> SearchFuture<'a> {
    Box::pin(async move {
        match plan {
            QueryPlan::Single(query) => store.search(group, query).await,
            QueryPlan::Union(children) => {
                let mut seen = HashSet::new();
                let mut docs = Vec::new();
                for child in children {
                    for doc in run_plan(store, group, child).await? {
                        if seen.insert(doc.id.clone()) {
                            docs.push(doc);
                        }
                    }
                }
                Ok(docs)
            }
            QueryPlan::Intersection(children) => {
                let mut counts: HashMap<String, usize> = HashMap::new();
                let mut first: Vec<StoredDocument> = Vec::new();
                for (i, child) in children.iter().enumerate() {
                    for doc in run_plan(store, group, child).await? {
                        *counts.entry(doc.id.clone()).or_default() += 1;
                        if i == 0 {
                            first.push(doc);
                        }
                    }
                }
                Ok(first
                    .into_iter()
                    .filter(|doc| counts.get(&doc.id) == Some(&children.len()))
                    .collect())
            }
        }
    })
}
