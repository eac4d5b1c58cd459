//! pictask harness.
//!
//! Wires the gateway and the worker to a queue backend: Postgres for separate processes, or an
//! in-memory queue when both run in one process (`standalone`).

pub mod config;
pub mod gateway;
pub mod migrate;
pub mod standalone;
pub mod worker;

/// Resolves once Ctrl-C is received. A failing signal handler is logged and treated as a request
/// to stop.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            event = "pictask.harness.signal.error",
            error = %err,
            "failed to listen for ctrl-c"
        );
    }
}
