// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable checkpoint storage.
//!
//! Checkpoints are written as ordinary documents through the same bulk-upsert
//! path as entity documents, one document per `(data source, entity type)`.

use std::sync::Arc;

use tracing::{debug, info};

use super::{Checkpoint, CheckpointRecord};
use crate::error::{ImportError, Result};
use crate::model::{DataSourceId, EntityType, SourceKind};
use crate::persistence::{DocumentQuery, DocumentStore, DocumentWrite, Filter, StoreError};

/// Group holding checkpoint documents.
pub const CHECKPOINT_GROUP: &str = "import-checkpoints";

/// Loads and saves checkpoints for one or more data sources.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn DocumentStore>,
}

impl CheckpointStore {
    /// Wrap a document store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Document id of a checkpoint.
    pub fn document_id(data_source_id: &DataSourceId, entity_type: EntityType) -> String {
        format!("{}:{}", data_source_id, entity_type)
    }

    /// Load one checkpoint, or the zero checkpoint when none was stored.
    pub async fn load(
        &self,
        data_source_id: &DataSourceId,
        entity_type: EntityType,
        kind: SourceKind,
    ) -> Result<Checkpoint> {
        let id = Self::document_id(data_source_id, entity_type);
        let docs = self
            .store
            .search(CHECKPOINT_GROUP, &DocumentQuery::by_ids(vec![id]))
            .await?;

        match docs.into_iter().next() {
            Some(doc) => {
                let record: CheckpointRecord =
                    serde_json::from_value(doc.body).map_err(StoreError::from)?;
                Ok(Checkpoint::from_record(record, kind)?)
            }
            None => Ok(Checkpoint::zero(data_source_id.clone(), entity_type, kind)),
        }
    }

    /// Load every stored checkpoint of a data source.
    pub async fn load_all(&self, data_source_id: &DataSourceId) -> Result<Vec<CheckpointRecord>> {
        let query = DocumentQuery::new().filter(Filter::FieldEquals {
            field: "dataSourceId".to_string(),
            value: serde_json::Value::String(data_source_id.to_string()),
        });
        let docs = self.store.search(CHECKPOINT_GROUP, &query).await?;

        docs.into_iter()
            .map(|doc| {
                serde_json::from_value::<CheckpointRecord>(doc.body)
                    .map_err(|e| ImportError::from(StoreError::from(e)))
            })
            .collect()
    }

    /// Persist the given checkpoints. Writes are unconditional: each
    /// checkpoint has exactly one owner.
    pub async fn save_many<'a, I>(&self, checkpoints: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Checkpoint>,
    {
        let writes = checkpoints
            .into_iter()
            .map(|checkpoint| {
                let id = Self::document_id(checkpoint.data_source_id(), checkpoint.entity_type());
                let body = serde_json::to_value(checkpoint.to_record()).map_err(StoreError::from)?;
                Ok(DocumentWrite::unconditional(id, body))
            })
            .collect::<Result<Vec<_>>>()?;

        if writes.is_empty() {
            return Ok(0);
        }

        if self.store.ensure_group(CHECKPOINT_GROUP).await? {
            info!(group = CHECKPOINT_GROUP, "Created checkpoint group");
        }

        let count = writes.len();
        self.store
            .bulk_upsert(CHECKPOINT_GROUP, writes)
            .await?
            .into_result(CHECKPOINT_GROUP)?;

        debug!(checkpoints = count, "Checkpoints saved");
        Ok(count)
    }

    /// Reset the given checkpoints to zero and persist them immediately.
    pub async fn reset<'a, I>(&self, checkpoints: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a mut Checkpoint>,
    {
        let mut checkpoints: Vec<&'a mut Checkpoint> = checkpoints.into_iter().collect();
        for checkpoint in checkpoints.iter_mut() {
            checkpoint.reset();
        }
        let saved = self.save_many(checkpoints.iter().map(|c| &**c)).await?;
        for checkpoint in checkpoints.iter_mut() {
            checkpoint.mark_flushed();
        }
        Ok(saved)
    }
}
