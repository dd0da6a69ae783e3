//! Job orchestration: bounded task execution, progress and recovery.

mod manager;
mod progress;
mod recovery;

pub use manager::{JobHandle, JobManager, TaskView, TasksPage};
pub use progress::{ProgressTracker, Settlement, Tally};
pub use recovery::{plan_resume, RecoveryReport};
