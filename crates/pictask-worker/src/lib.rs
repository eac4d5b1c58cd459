//! pictask filter worker.
//!
//! Pulls filter requests off the queue, runs the named filter on the blocking pool and reports the
//! outcome to the gateway's commit endpoint. A message is acked only once the gateway accepted
//! the commit; otherwise it is requeued and redelivered.

pub mod filter;
pub mod gateway_client;
pub mod retry;

use anyhow::Context;
use gateway_client::{GatewayClient, WriteDisposition};
use pictask_core::{
    CommitRequest, FilterMessage, Queue, QueueMessage, TaskId, DEFAULT_FILTER_QUEUE,
};
use retry::RetryPolicy;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub requeue_delay: Duration,

    /// A message delivered more often than this is committed as failed and acked.
    pub max_deliveries: u32,

    /// Number of consumer slots, each handling one message at a time.
    pub concurrency: usize,

    /// Filters running longer than this produce a failed commit. `None` waits indefinitely.
    ///
    /// Keep it below `visibility_timeout`: once the lease lapses the queue hands the same message
    /// to another consumer while this one is still filtering.
    pub operation_timeout: Option<Duration>,

    pub commit_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_FILTER_QUEUE.to_string(),
            poll_interval: Duration::from_millis(200),
            visibility_timeout: Duration::from_secs(60),
            requeue_delay: Duration::from_secs(1),
            max_deliveries: 5,
            concurrency: 1,
            operation_timeout: Some(Duration::from_secs(45)),
            commit_retry: RetryPolicy::default(),
        }
    }
}

/// Reasons a filter request could not produce a result. Each one becomes a failed commit.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error(transparent)]
    Filter(#[from] filter::FilterError),

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("filter task aborted: {0}")]
    Aborted(String),
}

pub struct Worker {
    cfg: WorkerConfig,
    queue: Arc<dyn Queue>,
    client: GatewayClient,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("cfg", &self.cfg)
            .field("client", &self.client)
            .finish()
    }
}

impl Worker {
    pub fn new(cfg: WorkerConfig, queue: Arc<dyn Queue>, client: GatewayClient) -> Self {
        Self { cfg, queue, client }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.cfg
    }

    /// Process one delivery end to end: filter, commit, then ack or requeue.
    pub async fn handle_message(&self, msg: QueueMessage) -> anyhow::Result<()> {
        let ack_token = msg.ack_token.clone();
        let exhausted = u32::try_from(msg.deliveries).unwrap_or(0) > self.cfg.max_deliveries;

        let commit = match serde_json::from_value::<FilterMessage>(msg.payload.clone()) {
            Ok(request) if exhausted => {
                tracing::warn!(
                    event = "pictask.worker.message.exhausted",
                    task_id = %request.task_id,
                    message_id = %msg.message_id,
                    deliveries = msg.deliveries,
                    "delivery limit reached; failing task"
                );
                CommitRequest::failed(
                    request.task_id,
                    format!("gave up after {} deliveries", msg.deliveries),
                )
            }
            Ok(request) => self.process(request).await,
            Err(err) => match recover_task_id(&msg.payload) {
                Some(task_id) => {
                    tracing::warn!(
                        event = "pictask.worker.message.malformed",
                        task_id = %task_id,
                        message_id = %msg.message_id,
                        error = %err,
                        "malformed task message; failing task"
                    );
                    CommitRequest::failed(task_id, format!("malformed task message: {err}"))
                }
                None => {
                    tracing::warn!(
                        event = "pictask.worker.message.invalid",
                        message_id = %msg.message_id,
                        error = %err,
                        "message without task id; dropping"
                    );
                    self.queue.ack(&ack_token).await.context("ack invalid message")?;
                    return Ok(());
                }
            },
        };

        let task_id = commit.id.clone();
        match self
            .client
            .commit_with_retry(&commit, &self.cfg.commit_retry)
            .await
        {
            Ok(disposition) => {
                if disposition == WriteDisposition::Conflict {
                    tracing::info!(
                        event = "pictask.worker.commit.conflict",
                        task_id = %task_id,
                        "gateway already holds an outcome for this task"
                    );
                }
                self.queue.ack(&ack_token).await.context("ack message")?;
                Ok(())
            }
            Err(err) if exhausted => {
                tracing::error!(
                    event = "pictask.worker.commit.abandoned",
                    task_id = %task_id,
                    error = %err,
                    "commit failed past the delivery limit; dropping message"
                );
                self.queue.ack(&ack_token).await.context("ack message")?;
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    event = "pictask.worker.commit.failed",
                    task_id = %task_id,
                    error = %err,
                    "commit failed; requeueing message"
                );
                self.queue
                    .nack_or_requeue(&ack_token, self.cfg.requeue_delay)
                    .await
                    .context("requeue message")?;
                Err(anyhow::Error::new(err).context(format!("commit task_id={task_id}")))
            }
        }
    }

    /// Run the filter and turn the outcome into a commit body.
    pub async fn process(&self, request: FilterMessage) -> CommitRequest {
        let task_id = request.task_id.clone();
        let operation = request.operation_name.clone();

        match self.run_filter(request).await {
            Ok(result) => {
                tracing::info!(
                    event = "pictask.worker.task.ready",
                    task_id = %task_id,
                    operation = %operation,
                    result_bytes = result.len(),
                    "filter applied"
                );
                CommitRequest::ready(task_id, &result)
            }
            Err(err) => {
                tracing::warn!(
                    event = "pictask.worker.task.failed",
                    task_id = %task_id,
                    operation = %operation,
                    error = %err,
                    "filter failed"
                );
                CommitRequest::failed(task_id, err.to_string())
            }
        }
    }

    async fn run_filter(&self, request: FilterMessage) -> Result<Vec<u8>, ProcessError> {
        let input = request.decode_payload()?;
        let operation = request.operation_name;
        let job = tokio::task::spawn_blocking(move || filter::apply(&operation, &input));

        let joined = match self.cfg.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, job)
                .await
                .map_err(|_| ProcessError::TimedOut(limit))?,
            None => job.await,
        };
        Ok(joined.map_err(|err| ProcessError::Aborted(err.to_string()))??)
    }
}

fn recover_task_id(payload: &Value) -> Option<TaskId> {
    payload
        .get("task_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(TaskId::from)
}

/// Consumer slots sharing one [`Worker`], stopped through a watch channel.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    slots: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(worker: Worker) -> Self {
        let worker = Arc::new(worker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slots = (0..worker.cfg.concurrency.max(1))
            .map(|slot| tokio::spawn(consume_loop(slot, worker.clone(), shutdown_rx.clone())))
            .collect();

        let lease_outlives_filter = worker
            .cfg
            .operation_timeout
            .is_some_and(|limit| limit < worker.cfg.visibility_timeout);
        if !lease_outlives_filter {
            tracing::warn!(
                event = "pictask.worker.config.lease",
                visibility_timeout = ?worker.cfg.visibility_timeout,
                operation_timeout = ?worker.cfg.operation_timeout,
                "operation timeout does not fit inside the visibility timeout; slow filters may be redelivered"
            );
        }

        tracing::info!(
            event = "pictask.worker.started",
            queue = %worker.cfg.queue_name,
            concurrency = worker.cfg.concurrency.max(1),
            "worker started"
        );

        Self { shutdown_tx, slots }
    }

    /// Stop taking new messages and wait for in-flight ones to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        for slot in self.slots {
            slot.await.context("join worker slot")?;
        }
        tracing::info!(event = "pictask.worker.shutdown", "worker stopped");
        Ok(())
    }
}

async fn consume_loop(slot: usize, worker: Arc<Worker>, mut shutdown_rx: watch::Receiver<bool>) {
    let cfg = &worker.cfg;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let received = tokio::select! {
            res = worker.queue.receive(&cfg.queue_name, 1, cfg.visibility_timeout) => res,
            _ = shutdown_rx.changed() => return,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(
                    event = "pictask.worker.receive.error",
                    slot,
                    error = %err,
                    "queue receive failed"
                );
                Vec::new()
            }
        };

        if messages.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(cfg.poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
            continue;
        }

        for msg in messages {
            if let Err(err) = worker.handle_message(msg).await {
                tracing::warn!(
                    event = "pictask.worker.message.error",
                    slot,
                    error = %err,
                    "worker message handling failed"
                );
            }
        }
    }
}
