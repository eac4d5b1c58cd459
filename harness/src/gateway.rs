use crate::config::HarnessConfig;
use anyhow::Context;
use pictask_core::{lite::pgqueue::PgQueue, Queue};
use pictask_gateway::identity::IdentityStore;
use pictask_gateway::{AppState, GatewayServer};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Build gateway state over an arbitrary queue backend.
pub fn build_state(cfg: &HarnessConfig, queue: Arc<dyn Queue>) -> anyhow::Result<AppState> {
    let identity = IdentityStore::new(cfg.identity_config()).context("init identity store")?;
    let verifier = cfg.commit_capability()?;
    Ok(AppState::new(cfg.gateway_config(), queue, identity, verifier))
}

/// Run the gateway against the Postgres queue until Ctrl-C.
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect queue db")?;
    let queue: Arc<dyn Queue> = Arc::new(PgQueue::new(pool));

    let state = build_state(cfg, queue)?;
    let server = GatewayServer::start(state, cfg.gateway_bind_addr()?, true).await?;

    crate::shutdown_signal().await;
    tracing::info!(event = "pictask.gateway.shutdown", "gateway shutting down");
    server.shutdown().await
}
