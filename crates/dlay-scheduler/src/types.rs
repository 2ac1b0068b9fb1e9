//! Task types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timeout applied when a task does not set one (or sets zero).
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// A persisted unit of work.
///
/// Tasks live in an external store. The scheduler receives them through
/// change notifications and hands back an updated copy after every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique identifier.
    pub id: String,
    /// When the task should next run.
    pub date: DateTime<Utc>,
    /// Current status of the task.
    #[serde(default)]
    pub status: TaskStatus,
    /// Name of the job to run.
    pub job: String,
    /// Payload handed to the job.
    #[serde(default)]
    pub data: Value,
    /// Consecutive retries in the current failure streak.
    #[serde(default)]
    pub retries: u32,
    /// Completed repeat cycles.
    #[serde(default)]
    pub repetitions: u32,
    /// Total attempts, regardless of outcome.
    #[serde(default)]
    pub executions: u32,
    /// Reschedule-on-failure policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RerunPolicy>,
    /// Reschedule-on-success policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RerunPolicy>,
    /// Milliseconds allowed for one attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Result of the last attempt, `false` when there was none.
    #[serde(default = "no_result")]
    pub result: Value,
    /// Error of the last attempt.
    #[serde(default)]
    pub error: Option<String>,
    /// Duration of the last attempt in milliseconds.
    #[serde(default)]
    pub duration: Option<u64>,
}

fn no_result() -> Value {
    Value::Bool(false)
}

/// Current status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Never run yet.
    #[default]
    Waiting,
    /// An attempt is in flight.
    Running,
    /// Succeeded and will repeat.
    Done,
    /// Succeeded for the last time.
    Complete,
    /// Failed and will retry.
    Retry,
    /// Failed for the last time.
    Failed,
}

/// Interval and cap for rerunning a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerunPolicy {
    /// Milliseconds added to the task date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Maximum value of the matching counter; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl RerunPolicy {
    /// Create a policy with the given interval in milliseconds.
    pub fn every(interval_ms: u64) -> Self {
        Self {
            interval: Some(interval_ms),
            limit: None,
        }
    }

    /// Cap the number of reruns.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl TaskStatus {
    /// Whether no further scheduling should happen for this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Complete => "complete",
            TaskStatus::Retry => "retry",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Task {
    /// Create a new waiting task.
    pub fn new(id: impl Into<String>, job: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            date,
            status: TaskStatus::Waiting,
            job: job.into(),
            data: Value::Null,
            retries: 0,
            repetitions: 0,
            executions: 0,
            retry: None,
            repeat: None,
            timeout: None,
            result: no_result(),
            error: None,
            duration: None,
        }
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a retry policy.
    pub fn with_retry(mut self, policy: RerunPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Attach a repeat policy.
    pub fn with_repeat(mut self, policy: RerunPolicy) -> Self {
        self.repeat = Some(policy);
        self
    }

    /// Set the per-attempt timeout in milliseconds.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Effective per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        let ms = self
            .timeout
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Duration::from_millis(ms)
    }

    /// Whether the task should be picked up by a scheduler.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Waiting | TaskStatus::Retry | TaskStatus::Done
        )
    }
}
