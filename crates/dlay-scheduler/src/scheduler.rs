//! Time-bucketed task scheduler.
//!
//! Due dates are rounded down to a multiple of the configured precision.
//! Every bucket holds its listeners in registration order, and one driver
//! loop sleeps until the earliest bucket, pops it and dispatches each
//! listener through a fresh [`ExecutionContext`]. However many tasks are
//! pending, there is at most one live timer per bucket.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::ExecutionContext;
use crate::job::Job;
use crate::store::TaskSink;
use crate::{SchedulerConfig, SchedulerError, Task};

/// Maximum sleep between driver wake-ups.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A request to run `job` for `task` at the task's date.
pub struct ScheduleEntry {
    task: Task,
    job: Arc<dyn Job>,
}

impl ScheduleEntry {
    pub fn new(task: Task, job: Arc<dyn Job>) -> Self {
        Self { task, job }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.task.date
    }

    pub fn task(&self) -> &Task {
        &self.task
    }
}

impl std::fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("id", &self.task.id)
            .field("date", &self.task.date)
            .field("job", &self.task.job)
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    /// Bucket start (ms since epoch) -> listeners in registration order.
    buckets: BTreeMap<i64, Vec<ScheduleEntry>>,
    /// Task id -> bucket it waits in.
    scheduled: HashMap<String, i64>,
    /// Task id -> attempt number and abort handle of the running attempt.
    in_flight: HashMap<String, (u64, AbortHandle)>,
    last_fired: Option<i64>,
    attempts: u64,
}

impl Registry {
    fn remove_scheduled(&mut self, id: &str) -> Option<ScheduleEntry> {
        let bucket = self.scheduled.remove(id)?;
        let listeners = self.buckets.get_mut(&bucket)?;
        let position = listeners.iter().position(|entry| entry.id() == id)?;
        let entry = listeners.remove(position);
        if listeners.is_empty() {
            self.buckets.remove(&bucket);
        }
        Some(entry)
    }
}

/// In-memory schedule of pending tasks.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Scheduler {
    precision_ms: i64,
    registry: Arc<Mutex<Registry>>,
    wake: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler from `config`.
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let precision_ms = i64::try_from(config.precision_ms)
            .map_err(|_| SchedulerError::InvalidConfig("precision_ms out of range".into()))?;

        Ok(Self {
            precision_ms,
            registry: Arc::new(Mutex::new(Registry::default())),
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn precision(&self) -> Duration {
        Duration::from_millis(self.precision_ms as u64)
    }

    /// Start of the bucket containing `date`.
    pub fn bucket_for(&self, date: DateTime<Utc>) -> DateTime<Utc> {
        millis_to_date(self.floor(date.timestamp_millis()))
    }

    /// Register `entry` and return the start of the bucket it will fire in.
    ///
    /// Scheduling an id that is already waiting replaces the earlier entry.
    pub fn schedule(&self, entry: ScheduleEntry) -> Result<DateTime<Utc>, SchedulerError> {
        if entry.id().is_empty() {
            return Err(SchedulerError::InvalidEntry("task id is empty".to_string()));
        }
        if entry.task().status.is_terminal() {
            return Err(SchedulerError::InvalidEntry(format!(
                "task {} is {} and cannot be scheduled",
                entry.id(),
                entry.task().status
            )));
        }

        let now_ms = Utc::now().timestamp_millis();
        let id = entry.id().to_string();
        let date = entry.date();

        let bucket = {
            let mut registry = self.registry();
            if registry.remove_scheduled(&id).is_some() {
                debug!(task_id = %id, "replacing scheduled entry");
            }
            let bucket = self.placement(date.timestamp_millis(), now_ms, registry.last_fired);
            registry.scheduled.insert(id.clone(), bucket);
            registry.buckets.entry(bucket).or_default().push(entry);
            bucket
        };
        self.wake.notify_one();

        let bucket = millis_to_date(bucket);
        debug!(task_id = %id, date = %date, bucket = %bucket, "task scheduled");
        Ok(bucket)
    }

    /// Remove a task from the schedule and cancel its running attempt.
    ///
    /// Returns `false` when the id was neither waiting nor running.
    pub fn unschedule(&self, id: &str) -> bool {
        let (waiting, running) = {
            let mut registry = self.registry();
            let waiting = registry.remove_scheduled(id).is_some();
            let running = registry.in_flight.remove(id);
            (waiting, running)
        };

        if let Some((attempt, handle)) = &running {
            debug!(task_id = %id, attempt, "cancelling in-flight attempt");
            handle.abort();
        }
        if waiting {
            self.wake.notify_one();
            debug!(task_id = %id, "task unscheduled");
        }

        waiting || running.is_some()
    }

    /// Number of tasks waiting in the bucket that contains `at`.
    pub fn listener_count(&self, at: DateTime<Utc>) -> usize {
        let bucket = self.floor(at.timestamp_millis());
        self.registry()
            .buckets
            .get(&bucket)
            .map_or(0, |listeners| listeners.len())
    }

    /// Number of live buckets, i.e. armed timers.
    pub fn bucket_count(&self) -> usize {
        self.registry().buckets.len()
    }

    /// Number of waiting tasks.
    pub fn scheduled_count(&self) -> usize {
        self.registry().scheduled.len()
    }

    /// Number of attempts currently running.
    pub fn in_flight_count(&self) -> usize {
        self.registry().in_flight.len()
    }

    /// Whether `id` is waiting for its bucket.
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.registry().scheduled.contains_key(id)
    }

    /// Whether an attempt of `id` is running.
    pub fn is_running(&self, id: &str) -> bool {
        self.registry().in_flight.contains_key(id)
    }

    /// Start of the bucket `id` waits in.
    pub fn scheduled_bucket(&self, id: &str) -> Option<DateTime<Utc>> {
        self.registry()
            .scheduled
            .get(id)
            .map(|bucket| millis_to_date(*bucket))
    }

    /// Run the driver loop until shutdown, handing finished tasks to `sink`.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>, sink: Arc<dyn TaskSink>) {
        info!(precision_ms = self.precision_ms, "scheduler starting");

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            let now_ms = Utc::now().timestamp_millis();
            if let Some((bucket, entries)) = self.take_due(now_ms) {
                debug!(
                    bucket = %millis_to_date(bucket),
                    count = entries.len(),
                    "bucket fired"
                );
                for entry in entries {
                    self.dispatch(entry, Arc::clone(&sink));
                }
                continue;
            }

            let wait = self.wait_duration(now_ms);
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }
                () = self.wake.notified() => {}
                () = sleep(wait) => {}
            }
        }

        let in_flight: Vec<(String, (u64, AbortHandle))> =
            self.registry().in_flight.drain().collect();
        if !in_flight.is_empty() {
            warn!(count = in_flight.len(), "aborting in-flight attempts");
        }
        for (_, (_, handle)) in in_flight {
            handle.abort();
        }

        info!("scheduler shut down gracefully");
    }

    /// Pop the earliest bucket if it is due.
    fn take_due(&self, now_ms: i64) -> Option<(i64, Vec<ScheduleEntry>)> {
        let mut registry = self.registry();
        let (&bucket, _) = registry.buckets.first_key_value()?;
        if bucket > now_ms {
            return None;
        }

        let (bucket, entries) = registry.buckets.pop_first()?;
        for entry in &entries {
            registry.scheduled.remove(entry.id());
        }
        registry.last_fired = Some(registry.last_fired.map_or(bucket, |fired| fired.max(bucket)));
        Some((bucket, entries))
    }

    /// Time until the earliest bucket, capped at [`MAX_SLEEP`].
    fn wait_duration(&self, now_ms: i64) -> Duration {
        let next = self.registry().buckets.first_key_value().map(|(b, _)| *b);
        match next {
            Some(bucket) => {
                let millis = u64::try_from(bucket - now_ms).unwrap_or_default();
                Duration::from_millis(millis).min(MAX_SLEEP)
            }
            None => MAX_SLEEP,
        }
    }

    /// Run one attempt in its own task.
    fn dispatch(&self, entry: ScheduleEntry, sink: Arc<dyn TaskSink>) {
        let id = entry.id().to_string();
        let scheduler = self.clone();

        let mut registry = self.registry();
        registry.attempts += 1;
        let attempt = registry.attempts;

        let span = info_span!("attempt", task_id = %id, attempt);
        let task_id = id.clone();
        let handle = tokio::spawn(
            async move {
                let ScheduleEntry { task, job } = entry;
                let result = ExecutionContext::new(task).execute(job.as_ref()).await;
                scheduler.finish_attempt(&task_id, attempt);

                match result {
                    Ok(next) => {
                        info!(
                            status = %next.status,
                            next_date = %next.date,
                            duration_ms = next.duration.unwrap_or_default(),
                            "attempt finished"
                        );
                        if let Err(e) = sink.submit(next).await {
                            error!(error = %e, "failed to submit task update");
                        }
                    }
                    Err(e) => error!(error = %e, "attempt aborted"),
                }
            }
            .instrument(span),
        );

        if let Some((previous, _)) = registry
            .in_flight
            .insert(id.clone(), (attempt, handle.abort_handle()))
        {
            warn!(task_id = %id, previous, attempt, "task already had an attempt in flight");
        }
    }

    fn finish_attempt(&self, id: &str, attempt: u64) {
        let mut registry = self.registry();
        if registry
            .in_flight
            .get(id)
            .is_some_and(|(current, _)| *current == attempt)
        {
            registry.in_flight.remove(id);
        }
    }

    /// Bucket a due date lands in, given the current time and the last fired bucket.
    fn placement(&self, date_ms: i64, now_ms: i64, last_fired: Option<i64>) -> i64 {
        let mut bucket = self.floor(date_ms);
        let current = self.floor(now_ms);
        if bucket < current {
            bucket = current + self.precision_ms;
        }
        match last_fired {
            Some(fired) if bucket <= fired => fired + self.precision_ms,
            _ => bucket,
        }
    }

    fn floor(&self, millis: i64) -> i64 {
        millis.div_euclid(self.precision_ms) * self.precision_ms
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Mutex poisoned: scheduler registry (recovering)");
                poisoned.into_inner()
            }
        }
    }
}

fn millis_to_date(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Invocation, JobError, job_fn};
    use crate::{RerunPolicy, TaskStatus};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[derive(Default)]
    struct CollectingSink {
        tasks: Mutex<Vec<Task>>,
    }

    impl CollectingSink {
        fn tasks(&self) -> Vec<Task> {
            self.tasks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskSink for CollectingSink {
        async fn submit(&self, task: Task) -> Result<(), SchedulerError> {
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    fn scheduler(precision_ms: u64) -> Scheduler {
        Scheduler::new(&SchedulerConfig::with_precision_ms(precision_ms)).unwrap()
    }

    fn noop() -> Arc<dyn Job> {
        job_fn(|_, _| Ok(Invocation::Immediate))
    }

    fn entry(id: &str, date: DateTime<Utc>) -> ScheduleEntry {
        ScheduleEntry::new(Task::new(id, "clear", date), noop())
    }

    /// A bucket-aligned instant well in the future.
    fn future_bucket(scheduler: &Scheduler) -> DateTime<Utc> {
        scheduler.bucket_for(Utc::now() + ChronoDuration::hours(1))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    // === Registry ===

    #[test]
    fn test_schedule_appends_listener() {
        let scheduler = scheduler(1000);
        let date = Utc::now() + ChronoDuration::seconds(30);

        scheduler.schedule(entry("857957d1", date)).unwrap();

        assert_eq!(scheduler.listener_count(date), 1);
        assert!(scheduler.is_scheduled("857957d1"));
        assert_eq!(
            scheduler.scheduled_bucket("857957d1"),
            Some(scheduler.bucket_for(date))
        );
    }

    #[test]
    fn test_unschedule_removes_listener() {
        let scheduler = scheduler(1000);
        let date = Utc::now() + ChronoDuration::seconds(30);

        scheduler.schedule(entry("857957d1", date)).unwrap();
        assert!(scheduler.unschedule("857957d1"));

        assert_eq!(scheduler.listener_count(date), 0);
        assert!(!scheduler.is_scheduled("857957d1"));
        assert_eq!(scheduler.bucket_count(), 0);
    }

    #[test]
    fn test_unschedule_unknown_id_is_noop() {
        let scheduler = scheduler(1000);
        assert!(!scheduler.unschedule("missing"));
    }

    #[test]
    fn test_same_window_shares_one_bucket() {
        let scheduler = scheduler(1000);
        let bucket = future_bucket(&scheduler);

        scheduler
            .schedule(entry("a", bucket + ChronoDuration::milliseconds(100)))
            .unwrap();
        scheduler
            .schedule(entry("b", bucket + ChronoDuration::milliseconds(900)))
            .unwrap();

        assert_eq!(scheduler.bucket_count(), 1);
        assert_eq!(scheduler.listener_count(bucket), 2);
    }

    #[test]
    fn test_adjacent_windows_use_separate_buckets() {
        let scheduler = scheduler(1000);
        let bucket = future_bucket(&scheduler);

        scheduler
            .schedule(entry("a", bucket + ChronoDuration::milliseconds(999)))
            .unwrap();
        scheduler
            .schedule(entry("b", bucket + ChronoDuration::milliseconds(1000)))
            .unwrap();

        assert_eq!(scheduler.bucket_count(), 2);
    }

    #[test]
    fn test_unschedule_keeps_shared_bucket_alive() {
        let scheduler = scheduler(1000);
        let bucket = future_bucket(&scheduler);

        scheduler.schedule(entry("a", bucket)).unwrap();
        scheduler.schedule(entry("b", bucket)).unwrap();
        scheduler.unschedule("a");

        assert_eq!(scheduler.bucket_count(), 1);
        assert_eq!(scheduler.listener_count(bucket), 1);
    }

    #[test]
    fn test_reschedule_replaces_entry() {
        let scheduler = scheduler(1000);
        let bucket = future_bucket(&scheduler);

        scheduler.schedule(entry("a", bucket)).unwrap();
        scheduler
            .schedule(entry("a", bucket + ChronoDuration::seconds(5)))
            .unwrap();

        assert_eq!(scheduler.scheduled_count(), 1);
        assert_eq!(scheduler.bucket_count(), 1);
        assert_eq!(scheduler.listener_count(bucket), 0);
        assert_eq!(
            scheduler.scheduled_bucket("a"),
            Some(bucket + ChronoDuration::seconds(5))
        );
    }

    #[test]
    fn test_past_date_goes_to_next_boundary() {
        let scheduler = scheduler(1000);
        let before = Utc::now();

        let bucket = scheduler
            .schedule(entry("late", before - ChronoDuration::hours(1)))
            .unwrap();
        let after = Utc::now();

        assert!(bucket > before);
        assert!(bucket <= scheduler.bucket_for(after) + ChronoDuration::seconds(1));
    }

    #[test]
    fn test_never_joins_fired_bucket() {
        let scheduler = scheduler(1000);
        let bucket = future_bucket(&scheduler);
        scheduler.registry().last_fired = Some(bucket.timestamp_millis());

        let placed = scheduler.schedule(entry("a", bucket)).unwrap();

        assert_eq!(placed, bucket + ChronoDuration::seconds(1));
    }

    #[test]
    fn test_due_bucket_pops_in_registration_order() {
        let scheduler = scheduler(1000);
        let bucket = future_bucket(&scheduler);

        for id in ["first", "second", "third"] {
            scheduler.schedule(entry(id, bucket)).unwrap();
        }

        assert!(scheduler.take_due(bucket.timestamp_millis() - 1).is_none());

        let (fired, entries) = scheduler.take_due(bucket.timestamp_millis()).unwrap();
        let ids: Vec<&str> = entries.iter().map(ScheduleEntry::id).collect();

        assert_eq!(fired, bucket.timestamp_millis());
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert_eq!(scheduler.scheduled_count(), 0);
        assert_eq!(scheduler.bucket_count(), 0);
    }

    #[test]
    fn test_wait_duration_capped() {
        let scheduler = scheduler(1000);
        let now_ms = Utc::now().timestamp_millis();
        assert_eq!(scheduler.wait_duration(now_ms), MAX_SLEEP);

        scheduler
            .schedule(entry("soon", Utc::now() + ChronoDuration::seconds(5)))
            .unwrap();
        assert!(scheduler.wait_duration(now_ms) <= Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_malformed_entries() {
        let scheduler = scheduler(1000);

        let result = scheduler.schedule(entry("", Utc::now()));
        assert!(matches!(result, Err(SchedulerError::InvalidEntry(_))));

        let mut task = Task::new("done", "clear", Utc::now());
        task.status = TaskStatus::Complete;
        let result = scheduler.schedule(ScheduleEntry::new(task, noop()));
        assert!(matches!(result, Err(SchedulerError::InvalidEntry(_))));
    }

    #[test]
    fn test_zero_precision_rejected() {
        assert!(Scheduler::new(&SchedulerConfig::with_precision_ms(0)).is_err());
    }

    // === Driver ===

    #[tokio::test]
    async fn test_fires_due_tasks_into_sink() {
        let scheduler = scheduler(20);
        let sink = Arc::new(CollectingSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let date = Utc::now() + ChronoDuration::milliseconds(40);
        scheduler
            .schedule(ScheduleEntry::new(
                Task::new("a", "echo", date).with_data(json!("hello")),
                job_fn(|task, _| {
                    let data = task.data.clone();
                    Ok(Invocation::deferred(async move { Ok(data) }))
                }),
            ))
            .unwrap();
        scheduler.schedule(entry("b", date)).unwrap();

        let driver = {
            let scheduler = scheduler.clone();
            let sink: Arc<dyn TaskSink> = sink.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx, sink).await })
        };

        assert!(wait_for(|| sink.tasks().len() == 2).await);
        shutdown_tx.send(true).unwrap();
        driver.await.unwrap();

        let mut tasks = sink.tasks();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(tasks[0].status, TaskStatus::Complete);
        assert_eq!(tasks[0].result, json!("hello"));
        assert_eq!(tasks[1].status, TaskStatus::Complete);
        assert_eq!(tasks[1].executions, 1);
        assert_eq!(scheduler.scheduled_count(), 0);
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_attempt_reports_retry() {
        let scheduler = scheduler(20);
        let sink = Arc::new(CollectingSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let date = Utc::now();
        let task = Task::new("flaky", "fail", date).with_retry(RerunPolicy::every(1000).limit(3));
        scheduler
            .schedule(ScheduleEntry::new(
                task,
                job_fn(|_, _| Err(JobError::new("upstream unavailable"))),
            ))
            .unwrap();

        let driver = {
            let scheduler = scheduler.clone();
            let sink: Arc<dyn TaskSink> = sink.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx, sink).await })
        };

        assert!(wait_for(|| sink.tasks().len() == 1).await);
        shutdown_tx.send(true).unwrap();
        driver.await.unwrap();

        let next = &sink.tasks()[0];
        assert_eq!(next.status, TaskStatus::Retry);
        assert_eq!(next.error.as_deref(), Some("upstream unavailable"));
        assert_eq!(next.date, date + ChronoDuration::seconds(1));
    }

    #[tokio::test]
    async fn test_unschedule_cancels_in_flight_attempt() {
        let scheduler = scheduler(20);
        let sink = Arc::new(CollectingSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = Task::new("slow", "sleep", Utc::now()).with_timeout(60_000);
        scheduler
            .schedule(ScheduleEntry::new(
                task,
                job_fn(|_, _| {
                    Ok(Invocation::deferred(async {
                        sleep(Duration::from_secs(30)).await;
                        Ok(json!("finished"))
                    }))
                }),
            ))
            .unwrap();

        let driver = {
            let scheduler = scheduler.clone();
            let sink: Arc<dyn TaskSink> = sink.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx, sink).await })
        };

        assert!(wait_for(|| scheduler.is_running("slow")).await);
        assert!(scheduler.unschedule("slow"));
        sleep(Duration::from_millis(100)).await;

        assert!(sink.tasks().is_empty());
        assert_eq!(scheduler.in_flight_count(), 0);

        shutdown_tx.send(true).unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_wakes_idle_driver() {
        let scheduler = scheduler(20);
        let sink = Arc::new(CollectingSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = {
            let scheduler = scheduler.clone();
            let sink: Arc<dyn TaskSink> = sink.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx, sink).await })
        };

        // Driver is asleep for MAX_SLEEP with an empty registry
        sleep(Duration::from_millis(50)).await;
        scheduler.schedule(entry("late-arrival", Utc::now())).unwrap();

        assert!(wait_for(|| sink.tasks().len() == 1).await);
        shutdown_tx.send(true).unwrap();
        driver.await.unwrap();
    }
}
