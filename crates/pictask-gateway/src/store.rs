//! Volatile task table.
//!
//! One `RwLock` guards the whole map. It is held only for the map operation itself, never across
//! an `.await`, so a reader can never observe a half-written record.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pictask_core::{TaskId, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    InProgress,
    Ready { result: Vec<u8> },
    Failed { error: Option<String> },
}

impl TaskState {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::InProgress => TaskStatus::InProgress,
            Self::Ready { .. } => TaskStatus::Ready,
            Self::Failed { .. } => TaskStatus::Failed,
        }
    }
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Ready(Vec<u8>),
    Failed(Option<String>),
}

impl From<TaskOutcome> for TaskState {
    fn from(value: TaskOutcome) -> Self {
        match value {
            TaskOutcome::Ready(result) => Self::Ready { result },
            TaskOutcome::Failed(error) => Self::Failed { error },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub state: TaskState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitDisposition {
    /// `in_progress -> terminal` transition written.
    Applied,
    /// The task already holds exactly this outcome; nothing written.
    Duplicate,
    /// The task already holds a different terminal outcome; nothing written.
    Conflict,
    /// No task with this id; nothing written.
    Unknown,
}

#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert; overwrites any prior record for `id`.
    pub fn put(&self, id: TaskId, state: TaskState) {
        let record = TaskRecord {
            state,
            updated_at: Utc::now(),
        };
        self.tasks.write().insert(id, record);
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.read().get(id).cloned()
    }

    /// Status lookup that does not copy the result bytes.
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.read().get(id).map(|r| r.state.status())
    }

    pub fn remove(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.write().remove(id)
    }

    /// Apply a worker outcome, allowing only the forward `in_progress -> terminal` transition.
    pub fn commit(&self, id: &TaskId, outcome: TaskOutcome) -> CommitDisposition {
        let next = TaskState::from(outcome);
        let mut tasks = self.tasks.write();
        let Some(record) = tasks.get_mut(id) else {
            return CommitDisposition::Unknown;
        };

        if record.state == TaskState::InProgress {
            record.state = next;
            record.updated_at = Utc::now();
            CommitDisposition::Applied
        } else if record.state == next {
            CommitDisposition::Duplicate
        } else {
            CommitDisposition::Conflict
        }
    }

    /// Fail every task that has been `in_progress` since before `now - older_than`.
    pub fn expire_in_progress(&self, older_than: chrono::Duration, error: &str) -> Vec<TaskId> {
        let cutoff = Utc::now() - older_than;
        let mut expired = Vec::new();
        let mut tasks = self.tasks.write();
        for (id, record) in tasks.iter_mut() {
            if record.state == TaskState::InProgress && record.updated_at <= cutoff {
                record.state = TaskState::Failed {
                    error: Some(error.to_string()),
                };
                record.updated_at = Utc::now();
                expired.push(id.clone());
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
