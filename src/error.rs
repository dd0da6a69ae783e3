use thiserror::Error;

use crate::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Task handler not registered: {0}")]
    HandlerNotRegistered(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Stale task record at index {index}: {reason}")]
    StaleState { index: usize, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {id} already finished with status {status}")]
    JobAlreadyFinished { id: JobId, status: JobStatus },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Build a task failure from any displayable message.
    pub fn task(msg: impl std::fmt::Display) -> Self {
        Error::Task(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
