// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of per data source schedulers.
//!
//! Owns every scheduler of the process: schedulers are registered (built and
//! their checkpoints loaded), then spawned together, and addressed afterwards
//! through their [`SchedulerHandle`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{ConfigError, DataSourceConfig, ImportConfig};
use crate::error::{ImportError, Result};
use crate::model::DataSourceId;
use crate::persistence::DocumentStore;
use crate::scheduler::{ImportScheduler, SchedulerHandle};
use crate::source::SourceAdapter;

/// Schedulers of the process, keyed by data source.
pub struct ImportRegistry {
    store: Arc<dyn DocumentStore>,
    import: ImportConfig,
    handles: BTreeMap<DataSourceId, SchedulerHandle>,
    pending: Vec<ImportScheduler>,
    tasks: JoinSet<()>,
}

impl ImportRegistry {
    /// Create an empty registry writing into `store`.
    pub fn new(store: Arc<dyn DocumentStore>, import: ImportConfig) -> Self {
        Self {
            store,
            import,
            handles: BTreeMap::new(),
            pending: Vec::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Build the scheduler of `source`. It starts with [`spawn_all`](Self::spawn_all).
    pub async fn register(
        &mut self,
        source: &DataSourceConfig,
        adapter: SourceAdapter,
    ) -> Result<SchedulerHandle> {
        if self.handles.contains_key(&source.id) {
            return Err(ConfigError::Source {
                id: source.id.to_string(),
                reason: "data source already registered".to_string(),
            }
            .into());
        }

        let scheduler =
            ImportScheduler::build(source, adapter, self.store.clone(), &self.import).await?;
        let handle = scheduler.handle();
        self.handles.insert(source.id.clone(), handle.clone());
        self.pending.push(scheduler);
        Ok(handle)
    }

    /// Handle of a registered data source.
    pub fn handle(&self, data_source_id: &str) -> Result<&SchedulerHandle> {
        self.handles
            .get(&DataSourceId::new(data_source_id))
            .ok_or_else(|| ImportError::UnknownDataSource(data_source_id.to_string()))
    }

    /// Every handle, ordered by data source id.
    pub fn handles(&self) -> impl Iterator<Item = &SchedulerHandle> {
        self.handles.values()
    }

    /// Spawn every scheduler registered since the last call.
    pub fn spawn_all(&mut self) -> usize {
        let count = self.pending.len();
        for scheduler in self.pending.drain(..) {
            self.tasks.spawn(scheduler.run());
        }
        if count > 0 {
            info!(schedulers = count, "Import schedulers spawned");
        }
        count
    }

    /// Reset every data source's checkpoints.
    pub async fn reset_all(&self) -> Result<usize> {
        let mut total = 0;
        for handle in self.handles.values() {
            total += handle.reset().await?;
        }
        Ok(total)
    }

    /// Signal every scheduler to stop and wait for them to flush.
    pub async fn shutdown_all(&mut self) {
        for handle in self.handles.values() {
            handle.shutdown();
        }
        self.pending.clear();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Import scheduler task failed");
            }
        }
        info!("Import schedulers stopped");
    }
}
