//! Task data model.
//!
//! A task has no identity of its own: it is addressed by its 0-based index
//! within its job, and its record lives only in that job's task store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task status in its lifecycle.
///
/// Transitions only go `Scheduled -> InProgress -> Done | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Scheduled,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    /// Whether the task already ran to an outcome and must not run again.
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Scheduled => write!(f, "SCHEDULED"),
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Done => write!(f, "DONE"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Persisted value of a task: opaque handler state plus status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub state: Value,
    pub status: TaskStatus,
}

impl TaskRecord {
    pub fn new(state: Value, status: TaskStatus) -> Self {
        Self { state, status }
    }

    pub fn scheduled(state: Value) -> Self {
        Self::new(state, TaskStatus::Scheduled)
    }
}

/// Input for one task of a run.
///
/// `skip` carries the outcome of a task that already settled in an earlier
/// run: it is counted toward completion but never executed again.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskSeed {
    pub state: Value,
    pub skip: Option<TaskStatus>,
}

impl TaskSeed {
    pub fn new(state: Value) -> Self {
        Self { state, skip: None }
    }

    /// A task that is counted but not executed.
    pub fn settled(state: Value, status: TaskStatus) -> Self {
        Self {
            state,
            skip: Some(status),
        }
    }

    pub fn is_skip(&self) -> bool {
        self.skip.is_some()
    }
}

impl From<Value> for TaskSeed {
    fn from(state: Value) -> Self {
        Self::new(state)
    }
}
