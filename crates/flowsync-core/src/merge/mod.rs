// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Merge writer: applies fragments to stored documents with idempotent
//! per-field rules and reports exactly which fragments were committed.
//!
//! For each target group the writer
//!
//! 1. creates the group on demand,
//! 2. loads the touched documents (and, for definitions, every document
//!    sharing a definition key) through the partitioned executor,
//! 3. merges fragments in page order using [`rules`],
//! 4. resolves definition soft deletes ([`definitions`]),
//! 5. writes changed documents with optimistic versions.
//!
//! A failure in one group never affects fragments of another group.

pub mod definitions;
pub mod rules;

pub use self::rules::{MergeRule, MergeScope, merge_object, rule_for, without_orders};

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::partition::PartitionedQueryExecutor;
use crate::persistence::{DocumentStore, DocumentWrite, StoreError};
use crate::transform::Fragment;

/// Fragments whose effect is not confirmed.
///
/// When the soft-delete update of a superseded definition fails, the
/// fragments of that definition slot are listed here even though their own
/// documents were written: the slot is unresolved until they are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedWrite {
    /// Indices into the fragment slice given to [`MergeWriter::write`].
    pub fragment_indices: Vec<usize>,
    /// Target group.
    pub group: String,
    /// Document that failed, `None` when the whole group failed.
    pub document_id: Option<String>,
    /// Failure detail.
    pub reason: String,
}

/// Outcome of one [`MergeWriter::write`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Indices of fragments whose effect is durably stored.
    pub committed: Vec<usize>,
    /// Fragments that were not stored or not confirmed.
    pub failed: Vec<FailedWrite>,
    /// Documents actually written (unchanged documents are skipped).
    pub documents_written: usize,
}

impl WriteReport {
    /// Whether every fragment was committed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of fragments that failed.
    pub fn failed_count(&self) -> usize {
        self.failed.iter().map(|f| f.fragment_indices.len()).sum()
    }
}

struct WorkingDoc {
    version: Option<u64>,
    original: Option<Value>,
    body: Value,
    fragments: Vec<usize>,
}

/// Writes fragments into a [`DocumentStore`].
#[derive(Clone)]
pub struct MergeWriter {
    store: Arc<dyn DocumentStore>,
    executor: PartitionedQueryExecutor,
    timeout: Duration,
    excluded_tenants: Arc<[String]>,
}

impl MergeWriter {
    /// Create a writer; the executor follows the store's clause limit.
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        let executor = PartitionedQueryExecutor::new(store.max_clause_count());
        Self {
            store,
            executor,
            timeout,
            excluded_tenants: Arc::from(Vec::new()),
        }
    }

    /// Leave stored definitions of these tenants untouched.
    ///
    /// Their records never reach the writer, but documents imported before
    /// the tenant was excluded still share definition keys with live ones.
    pub fn with_excluded_tenants(mut self, tenants: Vec<String>) -> Self {
        self.excluded_tenants = Arc::from(tenants);
        self
    }

    /// Apply `fragments` and report which of them were committed.
    pub async fn write(&self, fragments: &[Fragment]) -> WriteReport {
        let mut by_group: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, fragment) in fragments.iter().enumerate() {
            by_group.entry(fragment.group.as_str()).or_default().push(index);
        }

        let mut report = WriteReport::default();
        for (group, indices) in by_group {
            match self.write_group(group, fragments, &indices).await {
                Ok(outcome) => {
                    report.documents_written += outcome.documents_written;
                    report.committed.extend(outcome.committed);
                    report.failed.extend(outcome.failed);
                }
                Err(e) => {
                    warn!(group = %group, fragments = indices.len(), error = %e, "Group write failed");
                    report.failed.push(FailedWrite {
                        fragment_indices: indices,
                        group: group.to_string(),
                        document_id: None,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report.committed.sort_unstable();
        report
    }

    async fn timed<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    async fn write_group(
        &self,
        group: &str,
        fragments: &[Fragment],
        indices: &[usize],
    ) -> Result<WriteReport, StoreError> {
        if self.timed(self.store.ensure_group(group)).await? {
            info!(group = %group, "Created document group");
        }

        let ids: Vec<String> = indices
            .iter()
            .map(|&i| fragments[i].document_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let is_definition = indices
            .iter()
            .any(|&i| fragments[i].scope == MergeScope::Definition);

        let mut existing = self
            .timed(self.executor.search_by_ids(self.store.as_ref(), group, ids))
            .await?;
        if is_definition {
            let keys: Vec<String> = indices
                .iter()
                .filter_map(|&i| fragments[i].fields.get("key").and_then(Value::as_str))
                .map(str::to_string)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if !keys.is_empty() {
                let mut query = definitions::same_key_query(keys);
                if let Some(filter) =
                    PartitionedQueryExecutor::exclusion_filter("tenantId", &self.excluded_tenants)
                {
                    query = query.filter(filter);
                }
                existing.extend(
                    self.timed(self.executor.execute(self.store.as_ref(), group, &query))
                        .await?,
                );
            }
        }

        let mut working: BTreeMap<String, WorkingDoc> = BTreeMap::new();
        for doc in existing {
            working.entry(doc.id).or_insert_with(|| WorkingDoc {
                version: Some(doc.version),
                original: Some(doc.body.clone()),
                body: doc.body,
                fragments: Vec::new(),
            });
        }

        for &index in indices {
            let fragment = &fragments[index];
            let doc = working
                .entry(fragment.document_id.clone())
                .or_insert_with(|| WorkingDoc {
                    version: None,
                    original: None,
                    body: Value::Object(Map::new()),
                    fragments: Vec::new(),
                });
            let base = match &doc.body {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            doc.body = Value::Object(merge_object(fragment.scope, &base, &fragment.fields, &fragment.order));
            doc.fragments.push(index);
        }

        if is_definition {
            let changed = definitions::resolve_soft_deletes(
                working.iter_mut().map(|(id, doc)| (id.as_str(), &mut doc.body)),
            );
            if !changed.is_empty() {
                debug!(group = %group, definitions = ?changed, "Definition soft-delete flags changed");
            }
        }

        let mut report = WriteReport::default();
        let mut writes = Vec::new();
        for (id, doc) in &working {
            if doc.original.as_ref() == Some(&doc.body) {
                report.committed.extend(&doc.fragments);
                continue;
            }
            writes.push(DocumentWrite {
                id: id.clone(),
                expected_version: Some(doc.version.unwrap_or(0)),
                body: doc.body.clone(),
            });
        }

        if writes.is_empty() {
            debug!(group = %group, "Fragments already applied, nothing to write");
            return Ok(report);
        }

        let attempted = writes.len();
        let response = self.timed(self.store.bulk_upsert(group, writes)).await?;

        let mut collateral_failures = Vec::new();
        for item in response.items {
            let Some(doc) = working.get(&item.id) else {
                continue;
            };
            match item.outcome.failure_reason() {
                None => {
                    report.documents_written += 1;
                    report.committed.extend(&doc.fragments);
                }
                Some(reason) if doc.fragments.is_empty() => {
                    warn!(group = %group, document_id = %item.id, reason = %reason, "Soft-delete update failed");
                    collateral_failures.push((item.id, reason));
                }
                Some(reason) => {
                    warn!(group = %group, document_id = %item.id, reason = %reason, "Document write failed");
                    report.failed.push(FailedWrite {
                        fragment_indices: doc.fragments.clone(),
                        group: group.to_string(),
                        document_id: Some(item.id),
                        reason,
                    });
                }
            }
        }

        // A failed update of a document no fragment targeted (a superseded
        // definition) leaves its slot unresolved.
        for (id, reason) in collateral_failures {
            let slot = working.get(&id).and_then(|doc| definitions::slot_of(&doc.body));
            let in_slot = |index: &usize| {
                slot.is_none()
                    || working
                        .get(&fragments[*index].document_id)
                        .and_then(|doc| definitions::slot_of(&doc.body))
                        == slot
            };
            let (dependent, independent): (Vec<usize>, Vec<usize>) =
                std::mem::take(&mut report.committed).into_iter().partition(in_slot);
            report.committed = independent;
            report.failed.push(FailedWrite {
                fragment_indices: dependent,
                group: group.to_string(),
                document_id: Some(id),
                reason,
            });
        }

        debug!(
            group = %group,
            attempted,
            written = report.documents_written,
            failed = report.failed_count(),
            "Group merged"
        );
        Ok(report)
    }
}
