//! Resuming jobs interrupted by a process restart.
//!
//! A job left IN_PROGRESS is rebuilt from its task store: tasks that never
//! settled run again, settled ones only count toward progress. Malformed
//! task records are logged and counted as failed.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::job::{JobFilter, JobId, JobRecord, JobStatus, SortOrder};
use crate::orchestration::manager::{JobHandle, JobManager};
use crate::registry::HandlerEntry;
use crate::task::{ScanEntry, TaskSeed, TaskStatus};
use crate::{jlog, jlog_error, jlog_warn};

/// Outcome of one recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub resumed: Vec<JobHandle>,
    /// Jobs whose handler is not registered; left IN_PROGRESS.
    pub unrecoverable: Vec<JobId>,
    /// Jobs already running in this process.
    pub already_running: Vec<JobId>,
    /// Jobs whose task store could not be read.
    pub failed: Vec<(JobId, Error)>,
}

/// Seeds for a resumed run, one per scanned task index.
pub fn plan_resume(entries: Vec<ScanEntry>) -> Vec<TaskSeed> {
    entries
        .into_iter()
        .map(|entry| match entry {
            ScanEntry::Valid(_, record) if record.status.is_settled() => {
                TaskSeed::settled(record.state, record.status)
            }
            ScanEntry::Valid(_, record) => TaskSeed::new(record.state),
            ScanEntry::Stale(..) => TaskSeed::settled(Value::Null, TaskStatus::Failed),
        })
        .collect()
}

impl JobManager {
    /// Resume every IN_PROGRESS job not already running in this process.
    ///
    /// Safe to call more than once.
    pub async fn resume_all_unfinished(&self) -> Result<RecoveryReport> {
        let records = self
            .jobs()
            .list(&JobFilter::status(JobStatus::InProgress), None, SortOrder::OldestFirst)
            .await?;
        let mut report = RecoveryReport::default();

        for record in records {
            let entry = match self.registry().get(&record.handler_name) {
                Ok(entry) => entry,
                Err(e) => {
                    jlog_error!(
                        "Cannot resume job {} '{}': {}",
                        record.id.short(),
                        record.name,
                        e
                    );
                    report.unrecoverable.push(record.id);
                    continue;
                }
            };
            match self.resume_job(&record, &entry).await {
                Ok(Some(handle)) => report.resumed.push(handle),
                Ok(None) => report.already_running.push(record.id),
                Err(e) => {
                    jlog_error!("Failed to resume job {}: {}", record.id.short(), e);
                    report.failed.push((record.id, e));
                }
            }
        }

        if !report.resumed.is_empty() || !report.unrecoverable.is_empty() {
            jlog!(
                "Recovery: {} resumed, {} unrecoverable, {} already running",
                report.resumed.len(),
                report.unrecoverable.len(),
                report.already_running.len()
            );
        }
        Ok(report)
    }

    async fn resume_job(&self, record: &JobRecord, entry: &HandlerEntry) -> Result<Option<JobHandle>> {
        let control = match self.track(record.id).await {
            Some(control) => control,
            None => return Ok(None),
        };
        let scanned = async {
            let store = self.stores().open(record.id).await?;
            let entries = store.scan_from(0, usize::MAX).await?;
            Ok::<_, Error>((store, entries))
        }
        .await;
        let (store, entries) = match scanned {
            Ok(scanned) => scanned,
            Err(e) => {
                self.untrack(&record.id).await;
                return Err(e);
            }
        };

        let stale = entries
            .iter()
            .filter(|e| matches!(e, ScanEntry::Stale(..)))
            .count();
        if stale > 0 {
            jlog_warn!(
                "Job {}: {} malformed task records counted as failed",
                record.id.short(),
                stale
            );
        }
        let seeds = plan_resume(entries);
        let redo = seeds.iter().filter(|s| !s.is_skip()).count();
        jlog!(
            "Resuming job {} '{}': {} of {} tasks to run (limit {})",
            record.id.short(),
            record.name,
            redo,
            seeds.len(),
            entry.concurrency
        );
        Ok(Some(self.spawn_run(record.id, seeds, store, entry, control)))
    }
}
