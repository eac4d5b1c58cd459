//! Task lifecycle: submit, status, result, commit.
//!
//! Transport-agnostic; the HTTP handlers in the crate root are thin wrappers around [`Gateway`].

use crate::store::{CommitDisposition, TaskOutcome, TaskState, TaskStore};
use pictask_core::{
    decode_base64_payload, publish_within, CommitRequest, FilterMessage, PublishError, Queue,
    TaskId, TaskStatus,
};
use std::{sync::Arc, time::Duration};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub queue_name: String,
    pub publish_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("missing operation name")]
    MissingOperation,

    #[error("encode queue message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The task was rolled back; nothing stays `in_progress`.
    #[error(transparent)]
    Unavailable(#[from] PublishError),
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("commit status must be ready or failed")]
    NotTerminal,

    #[error("ready commit without a result")]
    MissingResult,

    #[error("result is not valid base64")]
    InvalidResult(#[from] base64::DecodeError),
}

#[derive(Clone)]
pub struct Gateway {
    store: Arc<TaskStore>,
    queue: Arc<dyn Queue>,
    cfg: LifecycleConfig,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("tasks", &self.store.len())
            .field("queue", &"<dyn Queue>")
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl Gateway {
    pub fn new(store: Arc<TaskStore>, queue: Arc<dyn Queue>, cfg: LifecycleConfig) -> Self {
        Self { store, queue, cfg }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Record the task as `in_progress`, then hand it to the queue.
    ///
    /// The record is written before publishing so a status poll right after this returns never
    /// sees "not found". If publishing fails the record is removed again.
    pub async fn submit(&self, payload: &[u8], operation: &str) -> Result<TaskId, SubmitError> {
        let operation = operation.trim();
        if payload.is_empty() {
            return Err(SubmitError::EmptyPayload);
        }
        if operation.is_empty() {
            return Err(SubmitError::MissingOperation);
        }

        let task_id = TaskId::generate();
        let message =
            serde_json::to_value(FilterMessage::new(task_id.clone(), payload, operation))?;

        self.store.put(task_id.clone(), TaskState::InProgress);

        let published = publish_within(
            self.queue.as_ref(),
            &self.cfg.queue_name,
            message,
            self.cfg.publish_timeout,
        )
        .await;

        match published {
            Ok(message_id) => {
                tracing::info!(
                    event = "pictask.gateway.task.submitted",
                    task_id = %task_id,
                    operation = %operation,
                    payload_bytes = payload.len(),
                    message_id = %message_id,
                    "task submitted"
                );
                Ok(task_id)
            }
            Err(err) => {
                self.store.remove(&task_id);
                tracing::warn!(
                    event = "pictask.gateway.task.publish_failed",
                    task_id = %task_id,
                    error = %err,
                    "queue publish failed; task rolled back"
                );
                Err(SubmitError::Unavailable(err))
            }
        }
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.store.status(task_id)
    }

    /// Result bytes, only once the task is `ready`. "Not ready" and "unknown" both yield `None`.
    pub fn result(&self, task_id: &TaskId) -> Option<Vec<u8>> {
        match self.store.get(task_id)?.state {
            TaskState::Ready { result } => Some(result),
            _ => None,
        }
    }

    pub fn commit(&self, req: CommitRequest) -> Result<CommitDisposition, CommitError> {
        let outcome = match req.status {
            TaskStatus::InProgress => return Err(CommitError::NotTerminal),
            TaskStatus::Ready => {
                let encoded = req.result.as_deref().ok_or(CommitError::MissingResult)?;
                TaskOutcome::Ready(decode_base64_payload(encoded)?)
            }
            TaskStatus::Failed => TaskOutcome::Failed(req.error),
        };

        let disposition = self.store.commit(&req.id, outcome);
        match disposition {
            CommitDisposition::Applied => tracing::info!(
                event = "pictask.gateway.commit.applied",
                task_id = %req.id,
                status = %req.status,
                "task committed"
            ),
            CommitDisposition::Duplicate => tracing::debug!(
                event = "pictask.gateway.commit.duplicate",
                task_id = %req.id,
                status = %req.status,
                "duplicate commit ignored"
            ),
            CommitDisposition::Conflict | CommitDisposition::Unknown => tracing::warn!(
                event = "pictask.gateway.commit.anomaly",
                task_id = %req.id,
                status = %req.status,
                disposition = ?disposition,
                "commit rejected"
            ),
        }
        Ok(disposition)
    }
}
