//! Fire-and-forget notifications of job and task transitions.
//!
//! Publishing never fails from the caller's point of view: a sink that
//! cannot deliver drops the event. A job's outcome never depends on
//! whether anyone was listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::job::{JobId, JobStatus};
use crate::task::TaskStatus;
use crate::jlog;

/// Topic every job event is published on.
pub const JOBS_TOPIC: &str = "/background-jobs";

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job record was created and its tasks are about to run.
    JobStarted {
        job_id: JobId,
        name: String,
        status: JobStatus,
        progress: u8,
        created_at: DateTime<Utc>,
    },
    /// Recomputed job progress after a task settled.
    JobProgress { job_id: JobId, progress: u8 },
    /// A task was marked in progress, done or failed.
    TaskStatusChanged {
        job_id: JobId,
        index: usize,
        status: TaskStatus,
    },
    /// The job reached a terminal status.
    JobFinished {
        job_id: JobId,
        status: JobStatus,
        finished_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobProgress { job_id, .. }
            | JobEvent::TaskStatusChanged { job_id, .. }
            | JobEvent::JobFinished { job_id, .. } => *job_id,
        }
    }
}

/// Notification channel provided by the host.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, event: JobEvent);
}

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(String, JobEvent)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, JobEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, topic: &str, event: JobEvent) {
        // Receiver may be gone; delivery is best-effort.
        let _ = self.tx.send((topic.to_string(), event));
    }
}

/// Writes events to the log file.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, topic: &str, event: JobEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => jlog!("event {} {}", topic, json),
            Err(e) => jlog!("event {} (unserializable: {})", topic, e),
        }
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _topic: &str, _event: JobEvent) {}
}
