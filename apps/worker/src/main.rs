//! Garrison workflow worker
//!
//! Runs the event-driven workflow engine: connects to the definition store,
//! starts the workflow manager against the platform event bus, and shuts
//! down gracefully on ctrl-c.

mod config;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;

use garrison_common::init_tracing;
use garrison_db::{PgExecutionRepository, PgKvRepository, PgVariableRepository, PgWorkflowRepository};
use garrison_domain::ServerId;
use garrison_workflow_engine::{
    InProcessEventBus, PgExecutionSink, RconClient, RconError, WorkflowManager,
};

use crate::config::Settings;

/// RCON client for dry-run deployments: logs and acknowledges commands.
///
/// Live deployments swap in the platform's RCON connector.
struct DryRunRconClient;

#[async_trait]
impl RconClient for DryRunRconClient {
    async fn execute(&self, server_id: &ServerId, command: &str) -> Result<String, RconError> {
        tracing::info!(server_id = %server_id, command = %command, "rcon dry-run");
        Ok(String::new())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    tracing::info!("starting garrison worker");

    let settings = Settings::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await?;

    let bus = Arc::new(InProcessEventBus::new());
    let rcon: Arc<dyn RconClient> = if settings.rcon.dry_run {
        tracing::warn!("rcon is in dry-run mode, commands are logged only");
        Arc::new(DryRunRconClient)
    } else {
        anyhow::bail!("no live rcon connector configured; set rcon.dry_run = true");
    };

    let manager = WorkflowManager::new(
        bus,
        Arc::new(PgWorkflowRepository::new(pool.clone())),
        Arc::new(PgVariableRepository::new(pool.clone())),
        Arc::new(PgExecutionRepository::new(pool.clone())),
        Arc::new(PgKvRepository::new(pool.clone())),
        Arc::new(PgExecutionSink::new(pool)),
        rcon,
    )?;

    manager.start().await?;
    tracing::info!("worker started, waiting for events");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    manager.shutdown().await;

    Ok(())
}
