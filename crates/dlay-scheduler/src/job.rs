//! Job contract.
//!
//! A job is invoked once per attempt and tells the execution context how it
//! will finish by returning an [`Invocation`]:
//!
//! - [`Invocation::Immediate`]: the work is already done, nothing is captured
//!   as result.
//! - [`Invocation::Deferred`]: a future resolving to the result or the error.
//! - [`Invocation::Callback`]: the job kept the [`Completion`] and will call
//!   it later.
//!
//! Returning `Err` from [`Job::invoke`] fails the attempt on the spot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::Task;

/// What a job produced when it finished.
pub type JobResult = Result<Value, JobError>;

/// Failure reported by a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    message: String,
}

impl JobError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// How an invoked job is going to finish.
pub enum Invocation {
    /// Finished synchronously without error.
    Immediate,
    /// Finishes when the future resolves.
    Deferred(BoxFuture<'static, JobResult>),
    /// Finishes when the job calls its [`Completion`].
    Callback,
}

impl Invocation {
    /// Box a future into a deferred invocation.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = JobResult> + Send + 'static,
    {
        Invocation::Deferred(Box::pin(future))
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invocation::Immediate => f.write_str("Immediate"),
            Invocation::Deferred(_) => f.write_str("Deferred(..)"),
            Invocation::Callback => f.write_str("Callback"),
        }
    }
}

/// One-shot completion handle handed to every job invocation.
///
/// Only callback-style jobs need to call it. Calls after the attempt has
/// already finished (for example after a timeout) are dropped.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<JobResult>,
}

impl Completion {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Report the outcome of the attempt.
    ///
    /// Returns `false` when the attempt no longer listens.
    pub fn done(self, result: JobResult) -> bool {
        self.tx.send(result).is_ok()
    }

    /// Report success with a result.
    pub fn succeed(self, result: Value) -> bool {
        self.done(Ok(result))
    }

    /// Report failure.
    pub fn fail(self, error: impl Into<JobError>) -> bool {
        self.done(Err(error.into()))
    }

    /// Whether the attempt stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A unit of work the scheduler can run.
pub trait Job: Send + Sync {
    /// Start one attempt for `task`.
    fn invoke(&self, task: &Task, done: Completion) -> Result<Invocation, JobError>;
}

struct FnJob<F>(F);

impl<F> Job for FnJob<F>
where
    F: Fn(&Task, Completion) -> Result<Invocation, JobError> + Send + Sync,
{
    fn invoke(&self, task: &Task, done: Completion) -> Result<Invocation, JobError> {
        (self.0)(task, done)
    }
}

/// Wrap a closure as a job.
pub fn job_fn<F>(f: F) -> Arc<dyn Job>
where
    F: Fn(&Task, Completion) -> Result<Invocation, JobError> + Send + Sync + 'static,
{
    Arc::new(FnJob(f))
}

/// Job lookup by name.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job, replacing any job with the same name.
    pub fn register(&mut self, name: impl Into<String>, job: Arc<dyn Job>) -> &mut Self {
        self.jobs.insert(name.into(), job);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, job: Arc<dyn Job>) -> Self {
        self.register(name, job);
        self
    }

    /// Look up a job.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    /// Whether a job with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}
