//! Job record types shared by the orchestrator and record stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a job, assigned by the record store on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Status of a job in its lifecycle.
///
/// `Done`, `DoneWithErrors` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Scheduled,
    InProgress,
    Done,
    DoneWithErrors,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::DoneWithErrors | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Scheduled => write!(f, "SCHEDULED"),
            JobStatus::InProgress => write!(f, "IN_PROGRESS"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::DoneWithErrors => write!(f, "DONE_WITH_ERRORS"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A job as held by the external record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub started_by: String,
    pub status: JobStatus,
    /// 0..=100, never decreases while the job is running.
    pub progress: u8,
    pub handler_name: String,
    /// Free-form metadata object reachable through the job field accessors.
    #[serde(default)]
    pub state: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Materialize a new record from its creation fields.
    pub fn from_new(id: JobId, new: NewJob) -> Self {
        Self {
            id,
            name: new.name,
            started_by: new.started_by,
            status: new.status,
            progress: new.progress,
            handler_name: new.handler_name,
            state: new.state,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        // A finished job keeps its final progress unless the update also
        // carries the terminal status.
        if let Some(progress) = update.progress {
            if update.status.is_some() || !self.status.is_terminal() {
                self.progress = progress.min(100);
            }
        }
        if let Some(finished_at) = update.finished_at {
            self.finished_at = Some(finished_at);
        }
        if let Some(state) = update.state {
            self.state = state;
        }
    }

    pub fn matches(&self, filter: &JobFilter) -> bool {
        filter.status.map_or(true, |s| s == self.status)
            && filter
                .started_by
                .as_deref()
                .map_or(true, |actor| actor == self.started_by)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            status: self.status,
            progress: self.progress,
        }
    }
}

/// Fields supplied when creating a job record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub started_by: String,
    pub handler_name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub state: Value,
}

impl NewJob {
    /// A job that starts running immediately, with empty metadata.
    pub fn in_progress(name: &str, started_by: &str, handler_name: &str) -> Self {
        Self {
            name: name.to_string(),
            started_by: started_by.to_string(),
            handler_name: handler_name.to_string(),
            status: JobStatus::InProgress,
            progress: 0,
            state: Value::Object(Default::default()),
        }
    }

    /// Replace the initial job-level state.
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }
}

/// Partial update of a job record; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: Option<Value>,
}

impl JobUpdate {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    /// Terminal transition: status plus finish time.
    pub fn finish(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn state(state: Value) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}

/// Equality filter over job records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub started_by: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn started_by(actor: &str) -> Self {
        Self {
            started_by: Some(actor.to_string()),
            ..Default::default()
        }
    }
}

/// Ordering of `list` results by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Listing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub progress: u8,
}
