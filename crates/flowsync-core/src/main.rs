// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! flowsync Importer
//!
//! Runs one import scheduler per configured data source:
//! - reads engine history or event log exports from `<entity>.jsonl` files
//! - merges them into the SQLite document store
//! - persists checkpoints so a restart resumes where it stopped

use std::sync::Arc;
use tracing::{info, warn};

use flowsync_core::config::{Config, load_sources};
use flowsync_core::model::SourceKind;
use flowsync_core::persistence::SqliteDocumentStore;
use flowsync_core::registry::ImportRegistry;
use flowsync_core::source::{FileSource, SourceAdapter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowsync_core=info".parse()?),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    config.import.validate()?;
    let sources = load_sources(&config.sources_file)?;

    info!(
        database_url = %config.database_url,
        sources_file = %config.sources_file.display(),
        data_sources = sources.len(),
        "Starting flowsync importer"
    );

    let store = if config.database_url.starts_with("sqlite:") {
        SqliteDocumentStore::connect(&config.database_url, config.import.max_clause_count).await?
    } else {
        SqliteDocumentStore::from_path(&config.database_url)
            .await?
            .with_max_clause_count(config.import.max_clause_count)
    };
    let store = Arc::new(store);
    info!("Document store ready");

    let mut registry = ImportRegistry::new(store, config.import.clone());
    for source in &sources {
        let files = Arc::new(FileSource::new(&source.path));
        let adapter = match source.kind {
            SourceKind::Engine => SourceAdapter::Timestamp(files),
            SourceKind::Log => SourceAdapter::Log(files),
        };
        registry.register(source, adapter).await?;
    }
    registry.spawn_all();

    info!("Importer running");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    registry.shutdown_all().await;

    info!("flowsync importer shut down");

    Ok(())
}
