//! Retry and repeat eligibility.
//!
//! Both policies share one rule: a task may run again `interval` milliseconds
//! after its current date as long as the matching counter is below `limit`.

use chrono::{DateTime, Duration, Utc};

use crate::{RerunPolicy, Task};

/// Compute the next date allowed by `policy`, or `None` when not eligible.
///
/// A missing policy, a missing or zero interval, or `current >= limit` all
/// mean "not eligible". A missing limit is unbounded.
pub fn rerunable(
    policy: Option<&RerunPolicy>,
    current: u32,
    base: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let policy = policy?;
    let interval = policy.interval.filter(|ms| *ms > 0)?;

    if policy.limit.is_some_and(|limit| current >= limit) {
        return None;
    }

    let interval = Duration::try_milliseconds(i64::try_from(interval).ok()?)?;
    base.checked_add_signed(interval)
}

/// Next retry date for `task`, if it may retry.
pub fn retryable(task: &Task) -> Option<DateTime<Utc>> {
    rerunable(task.retry.as_ref(), task.retries, task.date)
}

/// Next repeat date for `task`, if it may repeat.
pub fn repeatable(task: &Task) -> Option<DateTime<Utc>> {
    rerunable(task.repeat.as_ref(), task.repetitions, task.date)
}
