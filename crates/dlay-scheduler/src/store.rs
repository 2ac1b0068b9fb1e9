//! Task persistence.
//!
//! The scheduler itself keeps nothing durable. Finished attempts are handed
//! to a [`TaskSink`], and a [`TaskStore`] publishes every change so that the
//! [`ChangeFeed`](crate::ChangeFeed) can keep the schedule in step with it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::{SchedulerError, Task};

/// Broadcast channel capacity for task changes.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Receives the task produced by every finished attempt.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn submit(&self, task: Task) -> Result<(), SchedulerError>;
}

/// A change published by a [`TaskStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskChange {
    /// Task created or updated.
    Upserted(Task),
    /// Task removed.
    Deleted { id: String },
}

impl TaskChange {
    pub fn id(&self) -> &str {
        match self {
            TaskChange::Upserted(task) => &task.id,
            TaskChange::Deleted { id } => id,
        }
    }
}

/// Keyed task storage with a change stream.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a task.
    async fn put(&self, task: Task) -> Result<(), SchedulerError>;

    async fn get(&self, id: &str) -> Result<Option<Task>, SchedulerError>;

    /// All tasks, ordered by date then id.
    async fn list(&self) -> Result<Vec<Task>, SchedulerError>;

    /// Remove a task, returning it if it existed.
    async fn remove(&self, id: &str) -> Result<Option<Task>, SchedulerError>;

    /// Subscribe to changes made after this call.
    fn subscribe(&self) -> broadcast::Receiver<TaskChange>;
}

/// In-memory task store.
///
/// Thread-safe; every mutation is broadcast to subscribers.
pub struct MemoryStore {
    tasks: DashMap<String, Task>,
    changes_tx: broadcast::Sender<TaskChange>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            tasks: DashMap::new(),
            changes_tx,
        })
    }

    /// Create a store holding `tasks`, without broadcasting them.
    ///
    /// A later task replaces an earlier one with the same id.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Arc<Self> {
        let store = Self::new();
        for task in tasks {
            if let Some(previous) = store.tasks.insert(task.id.clone(), task) {
                warn!(task_id = %previous.id, "duplicate task id, keeping the later entry");
            }
        }
        store
    }

    /// Load a JSON array of tasks from `path`.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Arc<Self>, SchedulerError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        let tasks: Vec<Task> = serde_json::from_str(&contents)?;

        info!(path = %path.display(), count = tasks.len(), "loaded tasks");
        Ok(Self::from_tasks(tasks))
    }

    /// Write every task to `path` as a JSON array.
    pub async fn save_file(&self, path: impl AsRef<Path>) -> Result<(), SchedulerError> {
        let path = path.as_ref();
        let tasks = self.snapshot();
        let json = serde_json::to_string_pretty(&tasks)?;
        tokio::fs::write(path, json).await?;

        info!(path = %path.display(), count = tasks.len(), "saved tasks");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn snapshot(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|r| r.value().clone()).collect();
        tasks.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    fn broadcast(&self, change: TaskChange) {
        if self.changes_tx.send(change).is_err() {
            trace!("no subscribers for task change");
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn put(&self, task: Task) -> Result<(), SchedulerError> {
        if task.id.is_empty() {
            return Err(SchedulerError::Store("task id is empty".to_string()));
        }

        self.tasks.insert(task.id.clone(), task.clone());
        debug!(task_id = %task.id, status = %task.status, "store: task upserted");
        self.broadcast(TaskChange::Upserted(task));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, SchedulerError> {
        Ok(self.tasks.get(id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.snapshot())
    }

    async fn remove(&self, id: &str) -> Result<Option<Task>, SchedulerError> {
        let removed = self.tasks.remove(id).map(|(_, task)| task);
        if removed.is_some() {
            debug!(task_id = %id, "store: task deleted");
            self.broadcast(TaskChange::Deleted { id: id.to_string() });
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskChange> {
        self.changes_tx.subscribe()
    }
}

#[async_trait]
impl TaskSink for MemoryStore {
    async fn submit(&self, task: Task) -> Result<(), SchedulerError> {
        self.put(task).await
    }
}
