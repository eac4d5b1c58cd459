//! Gateway and worker in one process, sharing an in-memory queue.
//!
//! Nothing survives a restart. Meant for local use and end-to-end tests.

use crate::config::HarnessConfig;
use pictask_core::lite::memqueue::MemQueue;
use pictask_core::Queue;
use pictask_gateway::GatewayServer;
use pictask_worker::WorkerPool;
use std::{net::SocketAddr, sync::Arc};

#[derive(Debug)]
pub struct Standalone {
    pub gateway: GatewayServer,
    workers: WorkerPool,
}

impl Standalone {
    pub async fn start(cfg: &HarnessConfig, bind: SocketAddr) -> anyhow::Result<Self> {
        let queue: Arc<dyn Queue> = Arc::new(MemQueue::new());

        let state = crate::gateway::build_state(cfg, queue.clone())?;
        let gateway = GatewayServer::start(state, bind, true).await?;

        let worker = crate::worker::build_worker(cfg, queue, &gateway.base_url())?;
        let workers = WorkerPool::spawn(worker);

        Ok(Self { gateway, workers })
    }

    pub fn base_url(&self) -> String {
        self.gateway.base_url()
    }

    /// Stop the workers first so no commit targets a closed gateway.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.workers.shutdown().await?;
        self.gateway.shutdown().await
    }
}

pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let standalone = Standalone::start(cfg, cfg.gateway_bind_addr()?).await?;
    tracing::info!(
        event = "pictask.harness.standalone.started",
        url = %standalone.base_url(),
        "standalone gateway and worker running"
    );

    crate::shutdown_signal().await;
    standalone.shutdown().await
}
