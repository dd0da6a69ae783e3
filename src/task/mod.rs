//! Task records and their durable per-job store.

mod store;
mod types;

pub use store::{store_dir, ScanEntry, TaskStore, TaskStores};
pub use types::{TaskRecord, TaskSeed, TaskStatus};
