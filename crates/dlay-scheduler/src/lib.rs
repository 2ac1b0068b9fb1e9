//! Time-bucketed task scheduler for dlay.
//!
//! This crate provides an in-process scheduler that:
//! - Groups due dates into precision-sized buckets, one timer per bucket
//! - Runs each attempt in an execution context with a timeout watchdog
//! - Computes the next date, counters and status from retry and repeat policies
//! - Follows a task store's change stream to keep the schedule current

mod config;
mod context;
mod error;
mod feed;
mod job;
mod policy;
mod scheduler;
mod store;
mod types;

pub use config::{DEFAULT_PRECISION_MS, SchedulerConfig};
pub use context::{AttemptOutcome, ContextState, ExecutionContext, Incrementables, TIMEOUT_MESSAGE};
pub use error::SchedulerError;
pub use feed::{ChangeFeed, FeedAction};
pub use job::{Completion, Invocation, Job, JobError, JobRegistry, JobResult, job_fn};
pub use policy::{repeatable, rerunable, retryable};
pub use scheduler::{ScheduleEntry, Scheduler};
pub use store::{MemoryStore, TaskChange, TaskSink, TaskStore};
pub use types::{DEFAULT_TIMEOUT_MS, RerunPolicy, Task, TaskStatus};
