//! Keeps a [`Scheduler`] in step with a [`TaskStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::job::JobRegistry;
use crate::scheduler::{ScheduleEntry, Scheduler};
use crate::store::{TaskChange, TaskStore};
use crate::{SchedulerError, Task, TaskStatus};

/// What the feed did with one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedAction {
    /// Placed in the bucket starting at the given date.
    Scheduled(DateTime<Utc>),
    Unscheduled,
    Ignored,
}

/// Translates store changes into schedule and unschedule calls.
pub struct ChangeFeed {
    store: Arc<dyn TaskStore>,
    jobs: JobRegistry,
    scheduler: Scheduler,
}

impl ChangeFeed {
    pub fn new(store: Arc<dyn TaskStore>, jobs: JobRegistry, scheduler: Scheduler) -> Self {
        Self {
            store,
            jobs,
            scheduler,
        }
    }

    /// Apply one change to the schedule.
    pub fn handle_change(&self, change: TaskChange) -> Result<FeedAction, SchedulerError> {
        match change {
            TaskChange::Upserted(task) => self.handle_upsert(task),
            TaskChange::Deleted { id } => {
                self.scheduler.unschedule(&id);
                Ok(FeedAction::Unscheduled)
            }
        }
    }

    fn handle_upsert(&self, task: Task) -> Result<FeedAction, SchedulerError> {
        match task.status {
            TaskStatus::Waiting | TaskStatus::Retry | TaskStatus::Done => {
                if self.scheduler.is_running(&task.id) {
                    debug!(task_id = %task.id, "attempt in flight, not rescheduling");
                    return Ok(FeedAction::Ignored);
                }

                let job = self
                    .jobs
                    .get(&task.job)
                    .ok_or_else(|| SchedulerError::UnknownJob {
                        task_id: task.id.clone(),
                        job: task.job.clone(),
                    })?;
                let bucket = self.scheduler.schedule(ScheduleEntry::new(task, job))?;
                Ok(FeedAction::Scheduled(bucket))
            }
            TaskStatus::Complete | TaskStatus::Failed => {
                self.scheduler.unschedule(&task.id);
                Ok(FeedAction::Unscheduled)
            }
            TaskStatus::Running => Ok(FeedAction::Ignored),
        }
    }

    /// Schedule every schedulable task in the store.
    ///
    /// Returns how many tasks were scheduled. Tasks that fail to schedule
    /// are logged and skipped.
    pub async fn replay(&self) -> Result<usize, SchedulerError> {
        let tasks = self.store.list().await?;
        let mut scheduled = 0;

        for task in tasks.into_iter().filter(Task::is_schedulable) {
            let id = task.id.clone();
            match self.handle_upsert(task) {
                Ok(FeedAction::Scheduled(_)) => scheduled += 1,
                Ok(_) => {}
                Err(e) => warn!(task_id = %id, error = %e, "failed to schedule task"),
            }
        }

        info!(scheduled, "replayed task store");
        Ok(scheduled)
    }

    /// Replay the store, then follow its changes until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        // Subscribe first so nothing written during the replay is missed
        let mut rx = self.store.subscribe();
        self.replay().await?;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("change feed shutting down");
                        break;
                    }
                }
                change = rx.recv() => match change {
                    Ok(change) => {
                        let id = change.id().to_string();
                        match self.handle_change(change) {
                            Ok(action) => debug!(task_id = %id, ?action, "applied task change"),
                            Err(e) => warn!(task_id = %id, error = %e, "failed to apply task change"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "change feed lagged, replaying store");
                        self.replay().await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("task store closed, stopping change feed");
                        break;
                    }
                },
            }
        }

        Ok(())
    }
}
