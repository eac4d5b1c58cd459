use crate::config::HarnessConfig;
use anyhow::Context;
use pictask_core::{lite::pgqueue::PgQueue, Queue};
use pictask_worker::gateway_client::GatewayClient;
use pictask_worker::{Worker, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Build a worker that commits to `gateway_url`.
pub fn build_worker(
    cfg: &HarnessConfig,
    queue: Arc<dyn Queue>,
    gateway_url: &str,
) -> anyhow::Result<Worker> {
    let client = GatewayClient::new(
        gateway_url,
        cfg.commit_capability()?,
        cfg.commit_request_timeout(),
    )
    .context("init gateway client")?;
    Ok(Worker::new(cfg.worker_config(), queue, client))
}

/// Run the worker against the Postgres queue until Ctrl-C.
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let connections = u32::try_from(cfg.worker_concurrency.max(1)).unwrap_or(u32::MAX);
    let pool = PgPoolOptions::new()
        .max_connections(connections.saturating_add(1))
        .connect(&cfg.database_url)
        .await
        .context("connect queue db")?;
    let queue: Arc<dyn Queue> = Arc::new(PgQueue::new(pool));

    let workers = WorkerPool::spawn(build_worker(cfg, queue, &cfg.gateway_url)?);

    crate::shutdown_signal().await;
    workers.shutdown().await
}
