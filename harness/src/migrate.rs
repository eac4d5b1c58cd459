use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::HarnessConfig;

/// Apply the queue schema migrations.
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&cfg.database_url)
        .await
        .context("connect queue db")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate queue db")?;

    tracing::info!(event = "pictask.harness.migrate.done", "migrations complete");
    Ok(())
}
