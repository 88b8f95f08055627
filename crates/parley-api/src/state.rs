//! Application state wiring the engine to its concrete infrastructure.

use std::path::{Path, PathBuf};

use anyhow::Context;
use parley_core::workflow::engine::WorkflowEngine;
use parley_infra::action::builtin::builtin_registry;
use parley_infra::config::{load_engine_config, resolve_data_dir, resolve_database_url};
use parley_infra::sqlite::pool::DatabasePool;
use parley_infra::sqlite::workflow::SqliteWorkflowRepository;
use parley_types::config::EngineConfig;

/// The engine pinned to the SQLite repository.
pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;

/// Shared state for CLI commands.
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize from the resolved data directory: load `config.toml`, open
    /// the database, and register the built-in actions.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_url = resolve_database_url(&config, &data_dir);
        Self::open(&db_url, config, data_dir).await
    }

    /// Open state against an explicit database, e.g. a throwaway file for
    /// `parley run`.
    pub async fn open(db_url: &str, config: EngineConfig, data_dir: PathBuf) -> anyhow::Result<Self> {
        let pool = DatabasePool::new(db_url)
            .await
            .with_context(|| format!("Failed to open database {db_url}"))?;
        tracing::debug!(%db_url, "database ready");

        let engine = WorkflowEngine::new(
            SqliteWorkflowRepository::new(pool),
            builtin_registry(),
            config,
        );
        Ok(Self { engine, data_dir })
    }

    /// Open state backed by a database file inside `dir`.
    pub async fn scratch(dir: &Path, config: EngineConfig) -> anyhow::Result<Self> {
        let db_url = parley_infra::sqlite::pool::database_url_for(dir);
        Self::open(&db_url, config, dir.to_path_buf()).await
    }
}
