//! Postgres-backed [`Queue`] shared by separately running gateway and worker processes.
//!
//! Messages are rows in `pictask.queue_messages` (schema in `harness/migrations`). Receiving
//! leases a row by pushing `invisible_until` forward; acking deletes it.

use crate::{Error, Queue, QueueMessage, Result};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

const PUBLISH_SQL: &str = r#"
    INSERT INTO pictask.queue_messages (message_id, queue_name, payload, available_at)
    VALUES ($1, $2, $3, $4)
"#;

// SKIP LOCKED lets concurrent consumers lease disjoint rows.
const LEASE_SQL: &str = r#"
    UPDATE pictask.queue_messages AS m
    SET invisible_until = now() + make_interval(secs => $3),
        deliveries = m.deliveries + 1
    WHERE m.message_id IN (
        SELECT message_id
        FROM pictask.queue_messages
        WHERE queue_name = $1
          AND available_at <= now()
          AND (invisible_until IS NULL OR invisible_until <= now())
        ORDER BY available_at, created_at
        LIMIT $2
        FOR UPDATE SKIP LOCKED
    )
    RETURNING m.message_id, m.queue_name, m.payload, m.deliveries
"#;

const ACK_SQL: &str = "DELETE FROM pictask.queue_messages WHERE message_id = $1";

const REQUEUE_SQL: &str = r#"
    UPDATE pictask.queue_messages
    SET available_at = now() + make_interval(secs => $2),
        invisible_until = NULL
    WHERE message_id = $1
"#;

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct LeasedRow {
    message_id: Uuid,
    queue_name: String,
    payload: Value,
    deliveries: i32,
}

impl From<LeasedRow> for QueueMessage {
    fn from(row: LeasedRow) -> Self {
        let id = row.message_id.to_string();
        Self {
            ack_token: id.clone(),
            message_id: id,
            queue_name: row.queue_name,
            payload: row.payload,
            deliveries: row.deliveries,
        }
    }
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn publish(
        &self,
        queue: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4();
        sqlx::query(PUBLISH_SQL)
            .bind(message_id)
            .bind(queue)
            .bind(payload)
            .bind(available_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("pgqueue publish to queue={queue}"))?;
        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let rows: Vec<LeasedRow> = sqlx::query_as(LEASE_SQL)
            .bind(queue)
            .bind(max)
            .bind(visibility_timeout.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("pgqueue receive from queue={queue}"))?;
        Ok(rows.into_iter().map(QueueMessage::from).collect())
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        sqlx::query(ACK_SQL)
            .bind(parse_ack_token(ack_token)?)
            .execute(&self.pool)
            .await
            .context("pgqueue ack")?;
        Ok(())
    }

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()> {
        sqlx::query(REQUEUE_SQL)
            .bind(parse_ack_token(ack_token)?)
            .bind(delay.as_secs_f64())
            .execute(&self.pool)
            .await
            .context("pgqueue nack_or_requeue")?;
        Ok(())
    }
}

fn parse_ack_token(token: &str) -> Result<Uuid> {
    Uuid::parse_str(token).map_err(|_| Error::msg(format!("invalid pgqueue ack token: {token}")))
}
