//! Built-in jobs available to task files.

use std::time::Duration;

use dlay_scheduler::{Completion, Invocation, JobError, JobRegistry, Task, job_fn};
use serde_json::{Value, json};
use tracing::debug;

/// Registry with every built-in job.
pub fn builtin() -> JobRegistry {
    JobRegistry::new()
        .with("noop", job_fn(noop))
        .with("echo", job_fn(echo))
        .with("sleep", job_fn(sleep))
        .with("fail", job_fn(fail))
        .with("callback", job_fn(callback))
}

fn noop(task: &Task, _done: Completion) -> Result<Invocation, JobError> {
    debug!(task_id = %task.id, "noop");
    Ok(Invocation::Immediate)
}

/// Resolves with the task's data.
fn echo(task: &Task, _done: Completion) -> Result<Invocation, JobError> {
    let data = task.data.clone();
    Ok(Invocation::deferred(async move { Ok(data) }))
}

/// Sleeps for `data.ms` milliseconds.
fn sleep(task: &Task, _done: Completion) -> Result<Invocation, JobError> {
    let ms = task
        .data
        .get("ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| JobError::new("sleep requires data.ms"))?;

    Ok(Invocation::deferred(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }))
}

/// Fails with `data.message`, or a generic message.
fn fail(task: &Task, _done: Completion) -> Result<Invocation, JobError> {
    let message = task
        .data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("job failed");
    Err(JobError::new(message))
}

/// Echoes the task's data through the completion handle.
fn callback(task: &Task, done: Completion) -> Result<Invocation, JobError> {
    let data = task.data.clone();
    tokio::spawn(async move {
        if !done.succeed(data) {
            debug!("callback delivered after the attempt ended");
        }
    });
    Ok(Invocation::Callback)
}
