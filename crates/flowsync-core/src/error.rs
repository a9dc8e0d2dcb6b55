// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowsync-core.
//!
//! Each concern has its own error enum; [`ImportError`] unifies them for the
//! scheduler and registry surface and maps every variant to a stable code.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::persistence::StoreError;
use crate::source::SourceError;
use crate::transform::TransformError;

/// Result type using ImportError
pub type Result<T> = std::result::Result<T, ImportError>;

/// Errors surfaced by the import engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImportError {
    /// Invalid configuration; import for the affected source does not start.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Document store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Upstream source failure.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Malformed upstream record.
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    /// Cursor bookkeeping failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The scheduler of a data source is no longer running.
    #[error("scheduler for data source '{0}' is not running")]
    SchedulerStopped(String),

    /// No scheduler is registered for the data source.
    #[error("unknown data source '{0}'")]
    UnknownDataSource(String),
}

impl ImportError {
    /// Get the error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Store(StoreError::TooManyClauses { .. }) => "TOO_MANY_CLAUSES",
            Self::Store(StoreError::VersionConflict { .. }) => "VERSION_CONFLICT",
            Self::Store(_) => "STORE_ERROR",
            Self::Source(e) => e.kind.code(),
            Self::Transform(_) => "TRANSFORM_ERROR",
            Self::Checkpoint(_) => "CHECKPOINT_ERROR",
            Self::SchedulerStopped(_) => "SCHEDULER_STOPPED",
            Self::UnknownDataSource(_) => "UNKNOWN_DATA_SOURCE",
        }
    }

    /// Whether the error belongs to the configuration class that stops a source from starting.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Checkpoint(CheckpointError::KindMismatch { .. })
        )
    }
}
