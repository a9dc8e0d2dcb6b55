// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory document store.
//!
//! Enforces the clause limit and optimistic versions exactly like
//! [`SqliteDocumentStore`](super::SqliteDocumentStore). Write failures can be
//! injected per document id or for whole bulk calls, which is how partial
//! write failures are exercised in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::{
    BulkItemResult, BulkResponse, DEFAULT_MAX_CLAUSE_COUNT, DocumentQuery, DocumentStore,
    DocumentWrite, ItemOutcome, StoreError, StoredDocument, check_clause_limit, next_version,
    sort_documents,
};

type Groups = HashMap<String, BTreeMap<String, StoredDocument>>;

#[derive(Debug, Default)]
struct Faults {
    failing_ids: HashSet<String>,
    failing_bulk_calls: usize,
}

/// Document store held entirely in memory.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    max_clause_count: usize,
    groups: Arc<RwLock<Groups>>,
    faults: Arc<Mutex<Faults>>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    /// Create an empty store with the default clause limit.
    pub fn new() -> Self {
        Self::with_max_clause_count(DEFAULT_MAX_CLAUSE_COUNT)
    }

    /// Create an empty store with a custom clause limit.
    pub fn with_max_clause_count(max_clause_count: usize) -> Self {
        Self {
            max_clause_count,
            groups: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Reject every write of document `id` until [`clear_faults`](Self::clear_faults).
    pub async fn fail_writes_for(&self, id: impl Into<String>) {
        self.faults.lock().await.failing_ids.insert(id.into());
    }

    /// Fail the next `count` bulk calls as a whole with a retryable error.
    pub async fn fail_next_bulk_calls(&self, count: usize) {
        self.faults.lock().await.failing_bulk_calls = count;
    }

    /// Remove all injected faults.
    pub async fn clear_faults(&self) {
        let mut faults = self.faults.lock().await;
        faults.failing_ids.clear();
        faults.failing_bulk_calls = 0;
    }

    /// Read a single document.
    pub async fn get(&self, group: &str, id: &str) -> Option<StoredDocument> {
        self.groups
            .read()
            .await
            .get(group)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// All documents of a group, ordered by id.
    pub async fn documents(&self, group: &str) -> Vec<StoredDocument> {
        self.groups
            .read()
            .await
            .get(group)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn max_clause_count(&self) -> usize {
        self.max_clause_count
    }

    async fn ensure_group(&self, group: &str) -> Result<bool, StoreError> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(group) {
            return Ok(false);
        }
        groups.insert(group.to_string(), BTreeMap::new());
        Ok(true)
    }

    async fn group_exists(&self, group: &str) -> Result<bool, StoreError> {
        Ok(self.groups.read().await.contains_key(group))
    }

    async fn list_groups(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .groups
            .read()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn search(
        &self,
        group: &str,
        query: &DocumentQuery,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        check_clause_limit(query, self.max_clause_count)?;

        let groups = self.groups.read().await;
        let Some(docs) = groups.get(group) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<StoredDocument> = docs
            .values()
            .filter(|doc| query.filters.iter().all(|f| f.matches(doc)))
            .cloned()
            .collect();
        drop(groups);

        sort_documents(&mut matched, query.sort.as_ref());
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn bulk_upsert(
        &self,
        group: &str,
        writes: Vec<DocumentWrite>,
    ) -> Result<BulkResponse, StoreError> {
        let failing_ids = {
            let mut faults = self.faults.lock().await;
            if faults.failing_bulk_calls > 0 {
                faults.failing_bulk_calls -= 1;
                return Err(StoreError::Other("injected bulk failure".to_string()));
            }
            faults.failing_ids.clone()
        };

        let mut groups = self.groups.write().await;
        let docs = groups
            .get_mut(group)
            .ok_or_else(|| StoreError::GroupNotFound(group.to_string()))?;

        let mut items = Vec::with_capacity(writes.len());
        for write in writes {
            if failing_ids.contains(&write.id) {
                items.push(BulkItemResult {
                    id: write.id,
                    outcome: ItemOutcome::Rejected("injected write failure".to_string()),
                });
                continue;
            }

            let current = docs.get(&write.id).map(|doc| doc.version);
            let outcome = match next_version(write.expected_version, current) {
                Ok(version) => {
                    docs.insert(
                        write.id.clone(),
                        StoredDocument {
                            id: write.id.clone(),
                            version,
                            body: write.body,
                        },
                    );
                    ItemOutcome::Written { version }
                }
                Err(outcome) => outcome,
            };
            items.push(BulkItemResult {
                id: write.id,
                outcome,
            });
        }

        Ok(BulkResponse { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Filter;
    use serde_json::json;

    #[tokio::test]
    async fn test_ensure_group_reports_creation_once() {
        let store = MemoryDocumentStore::new();
        assert!(store.ensure_group("tenant").await.unwrap());
        assert!(!store.ensure_group("tenant").await.unwrap());
        assert!(store.group_exists("tenant").await.unwrap());
        assert!(!store.group_exists("other").await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_upsert_requires_group() {
        let store = MemoryDocumentStore::new();
        let result = store
            .bulk_upsert("missing", vec![DocumentWrite::unconditional("a", json!({}))])
            .await;
        assert!(matches!(result, Err(StoreError::GroupNotFound(_))));
    }

    #[tokio::test]
    async fn test_bulk_upsert_checks_versions_per_item() {
        let store = MemoryDocumentStore::new();
        store.ensure_group("g").await.unwrap();

        let response = store
            .bulk_upsert(
                "g",
                vec![
                    DocumentWrite::create("a", json!({"n": 1})),
                    DocumentWrite::replace("b", 3, json!({"n": 2})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(response.items[0].outcome, ItemOutcome::Written { version: 1 });
        assert_eq!(
            response.items[1].outcome,
            ItemOutcome::Conflict {
                expected: 3,
                actual: 0
            }
        );

        let response = store
            .bulk_upsert("g", vec![DocumentWrite::replace("a", 1, json!({"n": 5}))])
            .await
            .unwrap();
        assert!(response.all_written());
        let doc = store.get("g", "a").await.unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.body, json!({"n": 5}));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryDocumentStore::new();
        store.ensure_group("g").await.unwrap();
        store.fail_writes_for("b").await;

        let response = store
            .bulk_upsert(
                "g",
                vec![
                    DocumentWrite::unconditional("a", json!({})),
                    DocumentWrite::unconditional("b", json!({})),
                ],
            )
            .await
            .unwrap();
        assert!(response.items[0].outcome.is_written());
        assert!(matches!(response.items[1].outcome, ItemOutcome::Rejected(_)));
        assert!(store.get("g", "b").await.is_none());

        store.fail_next_bulk_calls(1).await;
        assert!(store.bulk_upsert("g", Vec::new()).await.is_err());
        assert!(store.bulk_upsert("g", Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_search_filters_sorts_and_limits() {
        let store = MemoryDocumentStore::with_max_clause_count(3);
        store.ensure_group("g").await.unwrap();
        store
            .bulk_upsert(
                "g",
                vec![
                    DocumentWrite::unconditional("a", json!({"key": "k1", "version": 2})),
                    DocumentWrite::unconditional("b", json!({"key": "k2", "version": 1})),
                    DocumentWrite::unconditional("c", json!({"key": "k1", "version": 1})),
                ],
            )
            .await
            .unwrap();

        let query = DocumentQuery::new()
            .filter(Filter::FieldIn {
                field: "key".into(),
                values: vec![json!("k1")],
            })
            .sort_by("version", true)
            .limit(1);
        let docs = store.search("g", &query).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "a");

        let too_big = DocumentQuery::by_ids(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        assert!(matches!(
            store.search("g", &too_big).await,
            Err(StoreError::TooManyClauses { actual: 4, limit: 3 })
        ));

        assert!(store.search("nope", &DocumentQuery::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_groups_by_prefix() {
        let store = MemoryDocumentStore::new();
        for group in ["process-instance-b", "process-instance-a", "tenant"] {
            store.ensure_group(group).await.unwrap();
        }
        assert_eq!(
            store.list_groups("process-instance-").await.unwrap(),
            vec!["process-instance-a", "process-instance-b"]
        );
    }
}
