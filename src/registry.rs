//! Registry of named task handlers.
//!
//! A handler is an async function run once per task. It sees the task only
//! through a [`TaskContext`], which can read and durably replace the task's
//! state but never its status. Handlers must be registered before any job
//! that names them starts or is resumed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::task::TaskStore;
use crate::jlog_debug;

/// Type-erased task body.
pub type TaskHandlerFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Accessors handed to a task body, bound to one task index.
#[derive(Clone, Debug)]
pub struct TaskContext {
    store: TaskStore,
    index: usize,
}

impl TaskContext {
    pub fn new(store: TaskStore, index: usize) -> Self {
        Self { store, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Current persisted state of this task.
    pub async fn get_state(&self) -> Result<Value> {
        let record = self.store.get(self.index).await?.ok_or_else(|| {
            Error::Store(format!("task {} has no record", self.index))
        })?;
        Ok(record.state)
    }

    /// Durably replace this task's state. Status is left untouched.
    pub async fn set_state(&self, state: Value) -> Result<()> {
        self.store.set_state(self.index, state).await
    }

    pub async fn state_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.get_state().await?)?)
    }

    pub async fn set_state_from<T: Serialize>(&self, state: &T) -> Result<()> {
        self.set_state(serde_json::to_value(state)?).await
    }
}

/// A registered handler with its per-job concurrency limit.
pub struct HandlerEntry {
    pub handler: TaskHandlerFn,
    pub concurrency: usize,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Process-wide table of handlers, shared behind an `Arc`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<HandlerEntry>>>,
    presentations: RwLock<HashMap<String, String>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. The last registration for a name wins.
    pub fn register<F, Fut>(&self, name: &str, concurrency: usize, handler: F) -> Result<()>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if name.is_empty() {
            return Err(Error::Configuration("handler name is empty".to_string()));
        }
        if concurrency == 0 {
            return Err(Error::Configuration(format!(
                "handler '{}' needs a concurrency limit of at least 1",
                name
            )));
        }
        let handler: TaskHandlerFn =
            Arc::new(move |ctx: TaskContext| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(ctx))
            });
        let entry = Arc::new(HandlerEntry {
            handler,
            concurrency,
        });
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.insert(name.to_string(), entry).is_some() {
            jlog_debug!("HandlerRegistry: replaced handler '{}'", name);
        } else {
            jlog_debug!("HandlerRegistry: registered '{}' limit={}", name, concurrency);
        }
        Ok(())
    }

    /// Attach a presentation reference (e.g. a UI component path) to a name.
    pub fn register_presentation(&self, name: &str, reference: &str) {
        self.presentations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), reference.to_string());
    }

    /// Look up a handler; an unknown name is a configuration error.
    pub fn get(&self, name: &str) -> Result<Arc<HandlerEntry>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::HandlerNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    pub fn presentation(&self, name: &str) -> Option<String> {
        self.presentations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
