//! Single-attempt execution context.
//!
//! ```text
//! created ──start()──▶ running ──finished()──▶ succeeded | failed | timed-out
//!                                                   │
//!                                   stop() ─▶ next() ─▶ finalized
//! ```
//!
//! The watchdog always wins: once the timeout elapses the in-flight work is
//! cancelled and any later completion from the job is ignored.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::job::{Completion, Invocation, Job, JobError, JobResult};
use crate::policy::{repeatable, retryable};
use crate::{SchedulerError, Task, TaskStatus};

/// Error recorded when the watchdog fires.
pub const TIMEOUT_MESSAGE: &str = "Job timed out";

/// Lifecycle state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Finalized,
}

impl ContextState {
    fn name(self) -> &'static str {
        match self {
            ContextState::Created => "created",
            ContextState::Running => "running",
            ContextState::Succeeded => "succeeded",
            ContextState::Failed => "failed",
            ContextState::TimedOut => "timed-out",
            ContextState::Finalized => "finalized",
        }
    }

    fn is_completed(self) -> bool {
        matches!(
            self,
            ContextState::Succeeded | ContextState::Failed | ContextState::TimedOut
        )
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub error: Option<JobError>,
    pub result: Option<Value>,
}

impl AttemptOutcome {
    fn from_result(result: JobResult) -> Self {
        match result {
            Ok(value) => Self {
                error: None,
                result: Some(value),
            },
            Err(error) => Self {
                error: Some(error),
                result: None,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Counters after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incrementables {
    pub retries: u32,
    pub repetitions: u32,
    pub executions: u32,
}

enum Pending {
    Ready(JobResult),
    Deferred(JoinHandle<JobResult>),
    Callback(oneshot::Receiver<JobResult>),
}

/// Owns one attempt of one task.
pub struct ExecutionContext {
    task: Task,
    state: ContextState,
    started_at: Option<Instant>,
    deadline: Option<Instant>,
    pending: Option<Pending>,
    execution: Option<AbortHandle>,
    duration: Option<u64>,
}

impl ExecutionContext {
    /// Create a context for the next attempt of `task`.
    pub fn new(task: Task) -> Self {
        Self {
            task,
            state: ContextState::Created,
            started_at: None,
            deadline: None,
            pending: None,
            execution: None,
            duration: None,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Measured duration in milliseconds, once stopped.
    pub fn duration(&self) -> Option<u64> {
        self.duration
    }

    /// Invoke `job` and arm the timeout watchdog.
    ///
    /// Returns as soon as the job has been invoked; use
    /// [`finished`](Self::finished) to wait for the outcome.
    pub fn start(&mut self, job: &dyn Job) -> Result<(), SchedulerError> {
        self.expect_state(ContextState::Created)?;

        info!(task_id = %self.task.id, date = %self.task.date, "started running");

        let started_at = Instant::now();
        self.started_at = Some(started_at);
        self.deadline = Some(started_at + self.task.timeout());
        self.state = ContextState::Running;

        let (done, rx) = Completion::channel();
        let invoked = catch_unwind(AssertUnwindSafe(|| job.invoke(&self.task, done)));

        let pending = match invoked {
            Ok(Ok(Invocation::Immediate)) => Pending::Ready(Ok(Value::Null)),
            Ok(Ok(Invocation::Deferred(future))) => {
                let handle = tokio::spawn(future);
                self.execution = Some(handle.abort_handle());
                Pending::Deferred(handle)
            }
            Ok(Ok(Invocation::Callback)) => Pending::Callback(rx),
            Ok(Err(error)) => Pending::Ready(Err(error)),
            Err(panic) => Pending::Ready(Err(JobError::new(panic_message(panic.as_ref())))),
        };
        self.pending = Some(pending);

        Ok(())
    }

    /// Wait for the attempt to complete or time out.
    pub async fn finished(&mut self) -> Result<AttemptOutcome, SchedulerError> {
        self.expect_state(ContextState::Running)?;

        let (Some(pending), Some(deadline)) = (self.pending.take(), self.deadline) else {
            return Err(SchedulerError::InvalidState {
                expected: "started attempt",
                found: self.state.name(),
            });
        };

        let outcome = tokio::select! {
            biased;
            () = sleep_until(deadline) => None,
            result = settle(pending) => Some(result),
        };

        let outcome = match outcome {
            Some(result) => {
                let outcome = AttemptOutcome::from_result(result);
                self.state = if outcome.is_success() {
                    ContextState::Succeeded
                } else {
                    ContextState::Failed
                };
                outcome
            }
            None => {
                warn!(
                    task_id = %self.task.id,
                    timeout_ms = self.task.timeout().as_millis() as u64,
                    "job timed out"
                );
                self.cancel();
                self.state = ContextState::TimedOut;
                AttemptOutcome {
                    error: Some(JobError::new(TIMEOUT_MESSAGE)),
                    result: None,
                }
            }
        };

        Ok(outcome)
    }

    /// Disarm the in-flight job invocation.
    ///
    /// No-op when the job already finished. Does not finalize the attempt.
    pub fn cancel(&mut self) {
        if let Some(execution) = self.execution.take() {
            if !execution.is_finished() {
                debug!(task_id = %self.task.id, "cancelling job execution");
            }
            execution.abort();
        }
    }

    /// Disarm the watchdog and return the elapsed time in milliseconds.
    pub fn stop(&mut self) -> Result<u64, SchedulerError> {
        if !self.state.is_completed() || self.duration.is_some() {
            return Err(SchedulerError::InvalidState {
                expected: "completed attempt",
                found: if self.duration.is_some() {
                    "stopped"
                } else {
                    self.state.name()
                },
            });
        }

        self.deadline = None;
        let elapsed = self
            .started_at
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or_default();
        self.duration = Some(elapsed);

        debug!(task_id = %self.task.id, duration_ms = elapsed, "stopping");
        Ok(elapsed)
    }

    /// Compute the next persisted version of the task.
    pub fn next(
        &mut self,
        error: Option<&JobError>,
        result: Option<&Value>,
    ) -> Result<Task, SchedulerError> {
        let Some(duration) = self.duration.filter(|_| self.state.is_completed()) else {
            return Err(SchedulerError::InvalidState {
                expected: "stopped attempt",
                found: self.state.name(),
            });
        };

        let failed = error.is_some();
        let date = self.next_date(failed);
        let counters = self.next_incrementables(failed);

        self.task.retries = counters.retries;
        self.task.repetitions = counters.repetitions;
        self.task.executions = counters.executions;

        let status = self.next_status(failed);

        let mut next = self.task.clone();
        next.date = date;
        next.status = status;
        next.error = error.map(ToString::to_string);
        next.result = match result {
            Some(value) if !value.is_null() => value.clone(),
            _ => Value::Bool(false),
        };
        next.duration = Some(duration);

        self.state = ContextState::Finalized;
        Ok(next)
    }

    /// Run the whole attempt: start, wait, stop, next.
    pub async fn execute(mut self, job: &dyn Job) -> Result<Task, SchedulerError> {
        self.start(job)?;
        let outcome = self.finished().await?;
        self.stop()?;
        self.next(outcome.error.as_ref(), outcome.result.as_ref())
    }

    /// Date of the next run, from the counters before this attempt.
    pub fn next_date(&self, failed: bool) -> DateTime<Utc> {
        let retry = if failed { retryable(&self.task) } else { None };
        retry
            .or_else(|| repeatable(&self.task))
            .unwrap_or(self.task.date)
    }

    /// Status after this attempt, from the current counters.
    pub fn next_status(&self, failed: bool) -> TaskStatus {
        if failed {
            if retryable(&self.task).is_some() {
                TaskStatus::Retry
            } else {
                TaskStatus::Failed
            }
        } else if repeatable(&self.task).is_some() {
            TaskStatus::Done
        } else {
            TaskStatus::Complete
        }
    }

    /// Counters after this attempt, from the status before it.
    pub fn next_incrementables(&self, failed: bool) -> Incrementables {
        let status = self.task.status;
        let mut retries = self.task.retries;
        let mut repetitions = self.task.repetitions;

        if failed {
            if status == TaskStatus::Retry {
                retries = retries.saturating_add(1);
            }
        } else {
            retries = 0;
            if status == TaskStatus::Done {
                repetitions = repetitions.saturating_add(1);
            }
        }

        Incrementables {
            retries,
            repetitions,
            executions: self.task.executions.saturating_add(1),
        }
    }

    fn expect_state(&self, expected: ContextState) -> Result<(), SchedulerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SchedulerError::InvalidState {
                expected: expected.name(),
                found: self.state.name(),
            })
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn settle(pending: Pending) -> JobResult {
    match pending {
        Pending::Ready(result) => result,
        Pending::Deferred(handle) => match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(JobError::new(panic_message(e.into_panic().as_ref()))),
            Err(_) => Err(JobError::new("Job cancelled")),
        },
        // A dropped completion can never fire; leave it to the watchdog.
        Pending::Callback(rx) => match rx.await {
            Ok(result) => result,
            Err(_) => std::future::pending().await,
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}
