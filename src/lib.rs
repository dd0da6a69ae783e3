//! Durable background jobs with bounded per-job concurrency.
//!
//! A job is a named batch of tasks run by a registered handler. Job records
//! live in an injected [`job::JobRecordStore`]; task records live in a
//! per-job directory under the store root so an interrupted job can be
//! resumed after a restart.

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod log;
pub mod orchestration;
pub mod registry;
pub mod task;
pub mod util;

pub use error::{Error, Result};
pub use events::{EventSink, JobEvent, JOBS_TOPIC};
pub use job::{JobId, JobRecord, JobStatus};
pub use orchestration::{JobHandle, JobManager, RecoveryReport, TasksPage};
pub use registry::{HandlerRegistry, TaskContext};
pub use task::{TaskSeed, TaskStatus};
