use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pictask_harness::{config, gateway, migrate, standalone, worker};

#[derive(Parser, Debug)]
#[command(name = "pictask")]
#[command(about = "Asynchronous image filter service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the Postgres queue schema.
    Migrate,

    /// Run the HTTP gateway on the Postgres queue.
    Gateway,

    /// Run the filter worker on the Postgres queue.
    Worker,

    /// Run gateway and worker in one process on an in-memory queue.
    Standalone,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pictask_gateway=debug,pictask_worker=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let cfg = config::HarnessConfig::from_env().context("load harness config")?;
    tracing::debug!(config = ?cfg, "loaded config");

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Gateway => gateway::run(&cfg).await,
        Command::Worker => worker::run(&cfg).await,
        Command::Standalone => standalone::run(&cfg).await,
    }
}
