//! Job records and the record-store capability.
//!
//! The orchestrator never owns job metadata; it reads and updates records
//! through a `JobRecordStore` supplied by the host.

mod json_store;
mod store;
mod types;

pub use json_store::JsonJobStore;
pub use store::{JobRecordStore, MemoryJobStore};
pub use types::{
    JobFilter, JobId, JobRecord, JobStatus, JobSummary, JobUpdate, NewJob, SortOrder,
};
