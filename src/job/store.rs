//! Job record store capability and an in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::types::{JobFilter, JobId, JobRecord, JobUpdate, NewJob, SortOrder};
use crate::error::{Error, Result};

/// Persistence of job metadata, provided by the host application.
///
/// The orchestrator only creates, reads, updates and lists records. Any
/// relational or document store can sit behind this trait.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Create a record and return it with its assigned id.
    async fn create(&self, new: NewJob) -> Result<JobRecord>;

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    /// Apply a partial update. Fails with `JobNotFound` for unknown ids.
    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<()>;

    async fn list(
        &self,
        filter: &JobFilter,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<JobRecord>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &JobId) -> Result<bool>;
}

/// Sort, then truncate, a filtered record set.
pub(crate) fn select(
    mut records: Vec<JobRecord>,
    filter: &JobFilter,
    limit: Option<usize>,
    order: SortOrder,
) -> Vec<JobRecord> {
    records.retain(|r| r.matches(filter));
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    if order == SortOrder::NewestFirst {
        records.reverse();
    }
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    records
}

/// Job records held in process memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRecordStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<JobRecord> {
        let record = JobRecord::from_new(JobId::new(), new);
        self.records.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or(Error::JobNotFound(*id))?;
        record.apply(update);
        Ok(())
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<JobRecord>> {
        let records: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        Ok(select(records, filter, limit, order))
    }

    async fn delete(&self, id: &JobId) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}
