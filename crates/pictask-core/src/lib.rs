//! Shared core abstractions for pictask.
//!
//! This crate defines the contracts shared by the gateway, the worker and the harness: the queue
//! channel, the queue/commit wire formats, and commit capability signing.
//!
//! # API notes
//! `pictask-core` is an internal crate (`publish = false`). Its public API uses a few third-party
//! types (`chrono::DateTime<Utc>`, `serde_json::Value`) as part of the queue contract.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, time::Duration};
use uuid::Uuid;

pub mod lite;

/// Header carrying the commit capability token on `POST /internal/commit`.
pub const COMMIT_CAPABILITY_HEADER: &str = "X-Pictask-Commit-Capability";

/// Default queue carrying filter requests from the gateway to the worker pool.
pub const DEFAULT_FILTER_QUEUE: &str = "image_filter";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow::anyhow!(message.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self { inner: value }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

/// Opaque task identifier. Always allocated by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Ready,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue message published by the gateway for each submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMessage {
    pub task_id: TaskId,
    /// Base64 (standard alphabet) image bytes.
    pub payload: String,
    pub operation_name: String,
}

impl FilterMessage {
    pub fn new(task_id: TaskId, image: &[u8], operation_name: impl Into<String>) -> Self {
        Self {
            task_id,
            payload: STANDARD.encode(image),
            operation_name: operation_name.into(),
        }
    }

    pub fn decode_payload(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        decode_base64_payload(&self.payload)
    }
}

/// Decode a base64 payload, tolerating a `data:<mime>;base64,` prefix.
pub fn decode_base64_payload(raw: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let raw = raw.trim();
    let body = match raw.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => raw,
    };
    STANDARD.decode(body)
}

/// Completion callback body (worker -> gateway).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub id: TaskId,
    pub status: TaskStatus,

    /// Base64 result bytes; present when `status == ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Human-readable failure detail; only meaningful when `status == failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommitRequest {
    pub fn ready(id: TaskId, result: &[u8]) -> Self {
        Self {
            id,
            status: TaskStatus::Ready,
            result: Some(STANDARD.encode(result)),
            error: None,
        }
    }

    pub fn failed(id: TaskId, error: impl Into<String>) -> Self {
        Self {
            id,
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Opaque token used to acknowledge or requeue the message.
    pub ack_token: String,

    /// Provider message id (for tracing).
    pub message_id: String,

    pub queue_name: String,
    pub payload: Value,
    pub deliveries: i32,
}

/// At-least-once, unordered channel consumed by a single logical consumer group.
///
/// A received message stays invisible for `visibility_timeout` and is redelivered unless it is
/// acked first. There is no deduplication.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String>;

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    async fn ack(&self, ack_token: &str) -> Result<()>;

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("queue publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue publish failed: {0}")]
    Failed(#[source] Error),
}

/// Publish immediately, failing with [`PublishError::Timeout`] instead of blocking past `timeout`.
pub async fn publish_within(
    queue: &dyn Queue,
    queue_name: &str,
    payload: Value,
    timeout: Duration,
) -> std::result::Result<String, PublishError> {
    match tokio::time::timeout(timeout, queue.publish(queue_name, payload, Utc::now())).await {
        Ok(Ok(message_id)) => Ok(message_id),
        Ok(Err(err)) => Err(PublishError::Failed(err)),
        Err(_) => Err(PublishError::Timeout(timeout)),
    }
}

pub trait Signer: Send + Sync {
    /// Issue a commit capability token (JWT) scoped to one task.
    ///
    /// The signer is responsible for setting `iss`, `aud`, `sub`, `iat`, `exp`.
    fn issue_commit_capability(&self, task_id: &TaskId) -> Result<String>;

    /// Verify and decode a commit capability token.
    fn verify_commit_capability(&self, token: &str) -> Result<CommitCapabilityClaims>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitCapabilityClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: usize,
    pub iat: usize,

    pub task_id: TaskId,
}
