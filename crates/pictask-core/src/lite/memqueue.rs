use crate::{Error, Queue, QueueMessage, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

/// In-process queue with the same visibility/redelivery semantics as [`super::pgqueue::PgQueue`].
///
/// Volatile: messages live only as long as the process. Cloning shares the underlying queue.
#[derive(Debug, Clone, Default)]
pub struct MemQueue {
    inner: Arc<Mutex<Messages>>,
}

#[derive(Debug, Default)]
struct Messages {
    by_id: HashMap<Uuid, StoredMessage>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    queue_name: String,
    payload: Value,
    available_at: DateTime<Utc>,
    invisible_until: Option<DateTime<Utc>>,
    deliveries: i32,
    seq: u64,
}

impl MemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages not yet acked (visible or in flight) on `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .by_id
            .values()
            .filter(|m| m.queue_name == queue)
            .count()
    }
}

#[async_trait]
impl Queue for MemQueue {
    async fn publish(
        &self,
        queue: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4();
        let mut messages = self.inner.lock();
        let seq = messages.next_seq;
        messages.next_seq += 1;
        messages.by_id.insert(
            message_id,
            StoredMessage {
                queue_name: queue.to_string(),
                payload,
                available_at,
                invisible_until: None,
                deliveries: 0,
                seq,
            },
        );
        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let now = Utc::now();
        let invisible_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let max = usize::try_from(max.max(0)).unwrap_or(usize::MAX);

        let mut messages = self.inner.lock();
        let mut visible: Vec<(Uuid, u64)> = messages
            .by_id
            .iter()
            .filter(|(_, m)| {
                m.queue_name == queue
                    && m.available_at <= now
                    && m.invisible_until.map_or(true, |t| t <= now)
            })
            .map(|(id, m)| (*id, m.seq))
            .collect();
        visible.sort_by_key(|(_, seq)| *seq);

        let mut picked = Vec::with_capacity(visible.len().min(max));
        for (id, _) in visible.into_iter().take(max) {
            let Some(m) = messages.by_id.get_mut(&id) else {
                continue;
            };
            m.invisible_until = Some(invisible_until);
            m.deliveries += 1;
            picked.push(QueueMessage {
                ack_token: id.to_string(),
                message_id: id.to_string(),
                queue_name: m.queue_name.clone(),
                payload: m.payload.clone(),
                deliveries: m.deliveries,
            });
        }

        Ok(picked)
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        let id = parse_ack_token(ack_token)?;
        self.inner.lock().by_id.remove(&id);
        Ok(())
    }

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()> {
        let id = parse_ack_token(ack_token)?;
        let available_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Some(m) = self.inner.lock().by_id.get_mut(&id) {
            m.available_at = available_at;
            m.invisible_until = None;
        }
        Ok(())
    }
}

fn parse_ack_token(token: &str) -> Result<Uuid> {
    Uuid::parse_str(token).map_err(|_| Error::msg(format!("invalid memqueue ack token: {token}")))
}
