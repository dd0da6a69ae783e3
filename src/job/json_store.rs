//! File-backed job record store.
//!
//! All records live in one JSON document. Every read goes back to disk so a
//! cancellation written by another process is seen at the next checkpoint.
//! Writes are load-modify-save under an advisory lock on `<file>.lock`, so
//! several processes sharing the file never lose each other's updates. The
//! new contents go through a uniquely named temp file and a rename.

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{select, JobRecordStore};
use super::types::{JobFilter, JobId, JobRecord, JobUpdate, NewJob, SortOrder};
use crate::error::{Error, Result};
use crate::util::blocking;
use crate::{jlog_debug, jlog_trace};

const JOBS_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct JobsFile {
    version: u32,
    jobs: Vec<JobRecord>,
}

impl Default for JobsFile {
    fn default() -> Self {
        Self {
            version: JOBS_FILE_VERSION,
            jobs: Vec::new(),
        }
    }
}

pub struct JsonJobStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<JobsFile> {
        let path = self.path.clone();
        blocking(move || {
            let lock = open_lock(&path)?;
            FileExt::lock_shared(&lock)?;
            let file = load_sync(&path);
            drop(lock);
            file
        })
        .await
    }

    /// Load, mutate and save the file while holding the exclusive file lock.
    /// The in-process mutex keeps tasks of this process from parking blocking
    /// threads on the same lock.
    async fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut JobsFile) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let lock = open_lock(&path)?;
            FileExt::lock_exclusive(&lock)?;
            let mut file = load_sync(&path)?;
            let out = f(&mut file)?;
            save_sync(&path, &file)?;
            drop(lock);
            Ok(out)
        })
        .await
    }
}

fn lock_path(path: &Path) -> PathBuf {
    path.with_extension("json.lock")
}

fn open_lock(path: &Path) -> Result<File> {
    ensure_parent(path)?;
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))?)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn load_sync(path: &Path) -> Result<JobsFile> {
    if !path.exists() {
        jlog_trace!("Jobs file not found, starting empty: {}", path.display());
        return Ok(JobsFile::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(JobsFile::default());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn save_sync(path: &Path, file: &JobsFile) -> Result<()> {
    ensure_parent(path)?;
    if path.exists() {
        fs::copy(path, path.with_extension("json.bak"))?;
    }
    let temp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    fs::write(&temp_path, serde_json::to_string_pretty(file)?)?;
    fs::rename(&temp_path, path)?;
    jlog_trace!("Jobs file saved: {} ({} jobs)", path.display(), file.jobs.len());
    Ok(())
}

#[async_trait]
impl JobRecordStore for JsonJobStore {
    async fn create(&self, new: NewJob) -> Result<JobRecord> {
        let record = JobRecord::from_new(JobId::new(), new);
        let stored = record.clone();
        self.modify(move |file| {
            file.jobs.push(stored);
            Ok(())
        })
        .await?;
        jlog_debug!("JsonJobStore::create id={} name={}", record.id.short(), record.name);
        Ok(record)
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let file = self.load().await?;
        Ok(file.jobs.into_iter().find(|r| r.id == *id))
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<()> {
        let id = *id;
        self.modify(move |file| {
            let record = file
                .jobs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(Error::JobNotFound(id))?;
            record.apply(update);
            Ok(())
        })
        .await
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<JobRecord>> {
        let file = self.load().await?;
        Ok(select(file.jobs, filter, limit, order))
    }

    async fn delete(&self, id: &JobId) -> Result<bool> {
        let id = *id;
        self.modify(move |file| {
            let before = file.jobs.len();
            file.jobs.retain(|r| r.id != id);
            Ok(file.jobs.len() != before)
        })
        .await
    }
}
