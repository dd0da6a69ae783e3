//! Durable per-job task store.
//!
//! Each job gets its own directory `job_<id>` under the store root. Every
//! task is one file named after its decimal index, `<index>.json`, holding a
//! serialized [`TaskRecord`]. Writes go to a unique temp file that is synced
//! and renamed over the target, so a reader sees either the old or the new
//! record and never a missing key.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{TaskRecord, TaskStatus};
use crate::error::{Error, Result};
use crate::job::JobId;
use crate::util::blocking;
use crate::{jlog_debug, jlog_trace, jlog_warn};

/// One entry produced by a contiguous scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEntry {
    Valid(usize, TaskRecord),
    /// A file exists at this index but does not hold a readable record.
    Stale(usize, String),
}

impl ScanEntry {
    pub fn index(&self) -> usize {
        match self {
            ScanEntry::Valid(index, _) | ScanEntry::Stale(index, _) => *index,
        }
    }
}

struct Inner {
    job_id: JobId,
    dir: PathBuf,
    /// Serializes read-modify-write updates of single fields.
    rmw: Mutex<()>,
}

/// Handle to one job's task records. Cheap to clone.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("job_id", &self.inner.job_id)
            .field("dir", &self.inner.dir)
            .finish()
    }
}

impl TaskStore {
    /// Open (creating if needed) the store directory for a job.
    pub async fn open(root: &Path, job_id: JobId) -> Result<Self> {
        let dir = store_dir(root, &job_id);
        let create = dir.clone();
        blocking(move || {
            fs::create_dir_all(&create)?;
            Ok(())
        })
        .await?;
        jlog_debug!("TaskStore::open job={} dir={}", job_id.short(), dir.display());
        Ok(Self {
            inner: Arc::new(Inner {
                job_id,
                dir,
                rmw: Mutex::new(()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub async fn put(&self, index: usize, record: &TaskRecord) -> Result<()> {
        let path = self.key_path(index);
        let bytes = serde_json::to_vec(record)?;
        blocking(move || write_atomic(&path, &bytes)).await?;
        jlog_trace!(
            "TaskStore::put job={} index={} status={}",
            self.inner.job_id.short(),
            index,
            record.status
        );
        Ok(())
    }

    /// Read one record. A present but unreadable file is a `StaleState` error.
    pub async fn get(&self, index: usize) -> Result<Option<TaskRecord>> {
        let path = self.key_path(index);
        blocking(move || read_record(&path, index)).await
    }

    pub async fn delete(&self, index: usize) -> Result<bool> {
        let path = self.key_path(index);
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    /// Replace a task's state, keeping its status.
    pub async fn set_state(&self, index: usize, state: Value) -> Result<()> {
        let _guard = self.inner.rmw.lock().await;
        let current = self.require(index).await?;
        self.put(index, &TaskRecord::new(state, current.status)).await
    }

    /// Replace a task's status, keeping its state.
    pub async fn set_status(&self, index: usize, status: TaskStatus) -> Result<()> {
        let _guard = self.inner.rmw.lock().await;
        let current = self.require(index).await?;
        self.put(index, &TaskRecord::new(current.state, status)).await
    }

    /// Contiguous run of entries starting at `start`.
    ///
    /// Stops at the first missing index or after `limit` entries. Unreadable
    /// records are returned as `Stale` and do not end the scan.
    pub async fn scan_from(&self, start: usize, limit: usize) -> Result<Vec<ScanEntry>> {
        let dir = self.inner.dir.clone();
        let job = self.inner.job_id.short();
        blocking(move || {
            let mut entries = Vec::new();
            let mut index = start;
            while entries.len() < limit {
                match read_record(&key_path(&dir, index), index) {
                    Ok(Some(record)) => entries.push(ScanEntry::Valid(index, record)),
                    Ok(None) => break,
                    Err(Error::StaleState { index, reason }) => {
                        jlog_warn!("Stale task record job={} index={}: {}", job, index, reason);
                        entries.push(ScanEntry::Stale(index, reason));
                    }
                    Err(e) => return Err(e),
                }
                index += 1;
            }
            Ok(entries)
        })
        .await
    }

    async fn require(&self, index: usize) -> Result<TaskRecord> {
        self.get(index).await?.ok_or_else(|| {
            Error::Store(format!(
                "task {} of job {} has no record",
                index, self.inner.job_id
            ))
        })
    }

    fn key_path(&self, index: usize) -> PathBuf {
        key_path(&self.inner.dir, index)
    }
}

/// Directory holding a job's task records.
pub fn store_dir(root: &Path, job_id: &JobId) -> PathBuf {
    root.join(format!("job_{}", job_id))
}

fn key_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{}.json", index))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

fn read_record(path: &Path, index: usize) -> Result<Option<TaskRecord>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::StaleState {
            index,
            reason: e.to_string(),
        })
}

/// Process-wide cache of open task stores, one handle per job.
pub struct TaskStores {
    root: PathBuf,
    open: Mutex<HashMap<JobId, TaskStore>>,
}

impl TaskStores {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached handle for a job, opening it on first use.
    pub async fn open(&self, job_id: JobId) -> Result<TaskStore> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(&job_id) {
            return Ok(store.clone());
        }
        let store = TaskStore::open(&self.root, job_id).await?;
        open.insert(job_id, store.clone());
        Ok(store)
    }

    /// Drop the cached handle. Returns whether one was open.
    pub async fn close(&self, job_id: &JobId) -> bool {
        self.open.lock().await.remove(job_id).is_some()
    }

    /// Close the handle and remove the job's directory from disk.
    pub async fn destroy(&self, job_id: &JobId) -> Result<()> {
        self.close(job_id).await;
        let dir = store_dir(&self.root, job_id);
        blocking(move || match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await?;
        jlog_debug!("TaskStores::destroy job={}", job_id.short());
        Ok(())
    }

    pub async fn open_count(&self) -> usize {
        self.open.lock().await.len()
    }
}
