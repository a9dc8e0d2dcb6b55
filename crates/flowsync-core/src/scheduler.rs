// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per data source scheduler.
//!
//! Runs the mediators of one data source round-robin, one round each per
//! cycle, and persists their checkpoints at a fixed interval. Control
//! requests (reset, flush) arrive through a [`SchedulerHandle`] and are
//! executed between cycles, so they never interleave with a round.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::config::{ConfigError, DataSourceConfig, ImportConfig};
use crate::error::{ImportError, Result};
use crate::fetcher::{Fetcher, FetcherSettings};
use crate::mediator::{ImportMediator, RoundOutcome};
use crate::merge::MergeWriter;
use crate::model::DataSourceId;
use crate::paging::{AdaptivePageSize, BackoffPolicy};
use crate::persistence::DocumentStore;
use crate::source::SourceAdapter;
use crate::transform::TransformContext;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between cycles.
    pub tick_interval: Duration,
    /// Minimum time between checkpoint flushes.
    pub flush_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&ImportConfig::default())
    }
}

impl From<&ImportConfig> for SchedulerConfig {
    fn from(import: &ImportConfig) -> Self {
        Self {
            tick_interval: import.tick_interval,
            flush_interval: import.checkpoint_flush_interval,
        }
    }
}

/// Totals of one [`ImportScheduler::run_cycle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rounds that fetched (skipped rounds excluded).
    pub rounds: usize,
    /// Records imported.
    pub records: usize,
    /// Rounds that failed.
    pub failures: usize,
}

enum Command {
    Reset(oneshot::Sender<Result<usize>>),
    Flush(oneshot::Sender<Result<usize>>),
}

/// Control surface of a running [`ImportScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    data_source_id: DataSourceId,
    enabled: Arc<AtomicBool>,
    checkpoints: watch::Receiver<Vec<CheckpointRecord>>,
    commands: mpsc::Sender<Command>,
    shutdown: Arc<Notify>,
}

impl SchedulerHandle {
    /// Data source of the scheduler.
    pub fn data_source_id(&self) -> &DataSourceId {
        &self.data_source_id
    }

    /// Resume rounds.
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            info!(data_source = %self.data_source_id, "Import enabled");
        }
    }

    /// Stop starting new rounds. A round already running completes.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            info!(data_source = %self.data_source_id, "Import disabled");
        }
    }

    /// Whether rounds are running.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Checkpoint values as of the last completed cycle.
    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.checkpoints.borrow().clone()
    }

    /// Reset every checkpoint of the data source, forcing a full re-import.
    ///
    /// Executed by the scheduler between cycles; returns the number of
    /// checkpoints reset.
    pub async fn reset(&self) -> Result<usize> {
        self.request(Command::Reset).await
    }

    /// Persist dirty checkpoints now.
    pub async fn flush(&self) -> Result<usize> {
        self.request(Command::Flush).await
    }

    /// Stop the scheduler after its current cycle.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<usize>>) -> Command,
    ) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ImportError::SchedulerStopped(self.data_source_id.to_string()))?;
        rx.await
            .map_err(|_| ImportError::SchedulerStopped(self.data_source_id.to_string()))?
    }
}

/// Runs the mediators of one data source.
pub struct ImportScheduler {
    data_source_id: DataSourceId,
    mediators: Vec<ImportMediator>,
    checkpoints: CheckpointStore,
    config: SchedulerConfig,
    enabled: Arc<AtomicBool>,
    snapshot: watch::Sender<Vec<CheckpointRecord>>,
    snapshot_rx: watch::Receiver<Vec<CheckpointRecord>>,
    command_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    shutdown: Arc<Notify>,
    last_flush: Instant,
}

impl ImportScheduler {
    /// Build a scheduler for `source`, loading its checkpoints.
    ///
    /// A stored checkpoint of the wrong cursor kind, or an adapter that does
    /// not match the configured kind, is a configuration error.
    pub async fn build(
        source: &DataSourceConfig,
        adapter: SourceAdapter,
        store: Arc<dyn DocumentStore>,
        import: &ImportConfig,
    ) -> Result<Self> {
        if adapter.kind() != source.kind {
            return Err(ConfigError::Source {
                id: source.id.to_string(),
                reason: format!(
                    "adapter kind {} does not match configured kind {}",
                    adapter.kind(),
                    source.kind
                ),
            }
            .into());
        }

        let checkpoints = CheckpointStore::new(store.clone());
        let writer = MergeWriter::new(store, import.write_timeout)
            .with_excluded_tenants(source.excluded_tenants.clone());
        let settings = FetcherSettings::from_config(import, source);
        let transform = TransformContext {
            default_tenant_id: source.default_tenant_id.clone(),
        };

        let mut seen = HashSet::new();
        let mut mediators = Vec::with_capacity(source.entities.len());
        for &entity_type in &source.entities {
            if !seen.insert(entity_type) {
                continue;
            }
            let checkpoint = checkpoints.load(&source.id, entity_type, source.kind).await?;
            mediators.push(ImportMediator::new(
                checkpoint,
                Fetcher::new(&adapter, entity_type, settings.clone()),
                writer.clone(),
                transform.clone(),
                AdaptivePageSize::new(import.page_size, import.min_page_size, import.max_page_size),
                BackoffPolicy::new(import.backoff_base, import.backoff_max),
            ));
        }

        let (command_tx, commands) = mpsc::channel(16);
        let (snapshot, snapshot_rx) = watch::channel(Vec::new());
        let scheduler = Self {
            data_source_id: source.id.clone(),
            mediators,
            checkpoints,
            config: SchedulerConfig::from(import),
            enabled: Arc::new(AtomicBool::new(source.import_enabled)),
            snapshot,
            snapshot_rx,
            command_tx,
            commands,
            shutdown: Arc::new(Notify::new()),
            last_flush: Instant::now(),
        };
        scheduler.publish();

        info!(
            data_source = %scheduler.data_source_id,
            kind = %source.kind,
            mediators = scheduler.mediators.len(),
            enabled = source.import_enabled,
            "Import scheduler built"
        );
        Ok(scheduler)
    }

    /// Data source of the scheduler.
    pub fn data_source_id(&self) -> &DataSourceId {
        &self.data_source_id
    }

    /// Mediators in round-robin order.
    pub fn mediators(&self) -> &[ImportMediator] {
        &self.mediators
    }

    /// Get a control handle.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            data_source_id: self.data_source_id.clone(),
            enabled: self.enabled.clone(),
            checkpoints: self.snapshot_rx.clone(),
            commands: self.command_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until shutdown, then flush checkpoints.
    pub async fn run(mut self) {
        info!(
            data_source = %self.data_source_id,
            tick_interval_ms = u64::try_from(self.config.tick_interval.as_millis()).unwrap_or(u64::MAX),
            flush_interval_ms = u64::try_from(self.config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            "Import scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(data_source = %self.data_source_id, "Import scheduler shutting down");
                    break;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    if self.enabled.load(Ordering::Acquire) {
                        self.run_cycle().await;
                    } else {
                        self.flush_if_due().await;
                    }
                }
            }
        }

        if let Err(e) = self.flush_checkpoints().await {
            error!(data_source = %self.data_source_id, error = %e, "Final checkpoint flush failed");
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reset(reply) => {
                let result = self.reset_checkpoints().await;
                let _ = reply.send(result);
            }
            Command::Flush(reply) => {
                let result = self.flush_checkpoints().await;
                let _ = reply.send(result);
            }
        }
    }

    /// Run one round per mediator. Failures are logged and never stop the
    /// scheduler; disabling import stops the cycle before the next round.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        for mediator in &mut self.mediators {
            if !self.enabled.load(Ordering::Acquire) {
                debug!(data_source = %self.data_source_id, "Import disabled, cycle stopped");
                break;
            }
            match mediator.run_round(Utc::now()).await {
                RoundOutcome::Skipped => {}
                RoundOutcome::Idle => report.rounds += 1,
                RoundOutcome::Imported { records, .. } => {
                    report.rounds += 1;
                    report.records += records;
                }
                RoundOutcome::Failed(_) => {
                    report.rounds += 1;
                    report.failures += 1;
                }
            }
        }

        self.publish();
        self.flush_if_due().await;
        report
    }

    async fn flush_if_due(&mut self) {
        if self.last_flush.elapsed() < self.config.flush_interval {
            return;
        }
        if let Err(e) = self.flush_checkpoints().await {
            warn!(data_source = %self.data_source_id, error = %e, "Checkpoint flush failed, will retry");
        }
    }

    /// Persist every dirty checkpoint. Returns the number written.
    pub async fn flush_checkpoints(&mut self) -> Result<usize> {
        self.last_flush = Instant::now();
        let dirty: Vec<_> = self
            .mediators
            .iter()
            .map(ImportMediator::checkpoint)
            .filter(|c| c.is_dirty())
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let saved = self.checkpoints.save_many(dirty).await?;
        for mediator in &mut self.mediators {
            mediator.checkpoint_mut().mark_flushed();
        }
        debug!(data_source = %self.data_source_id, checkpoints = saved, "Checkpoints flushed");
        Ok(saved)
    }

    /// Reset every checkpoint to zero and persist the reset immediately.
    pub async fn reset_checkpoints(&mut self) -> Result<usize> {
        let reset = self
            .checkpoints
            .reset(self.mediators.iter_mut().map(ImportMediator::checkpoint_mut))
            .await?;
        self.last_flush = Instant::now();
        self.publish();
        info!(data_source = %self.data_source_id, checkpoints = reset, "Checkpoints reset");
        Ok(reset)
    }

    fn publish(&self) {
        let records = self
            .mediators
            .iter()
            .map(|m| m.checkpoint().to_record())
            .collect();
        self.snapshot.send_replace(records);
    }
}
