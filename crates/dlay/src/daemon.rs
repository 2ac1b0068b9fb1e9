//! Run and validate commands.
//!
//! `run` wires the pieces together:
//! - A `MemoryStore` loaded from the task file
//! - The scheduler driver, submitting finished attempts back to the store
//! - The change feed, rescheduling whatever the store reports

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use miette::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use dlay_scheduler::{
    ChangeFeed, MemoryStore, Scheduler, SchedulerConfig, TaskSink, TaskStatus, TaskStore,
};

use crate::jobs;

/// Run the scheduler over `tasks` until Ctrl-C.
pub async fn run(tasks: &Path, config: SchedulerConfig, save: bool) -> Result<()> {
    info!(
        tasks = %tasks.display(),
        precision_ms = config.precision_ms,
        "starting dlay"
    );
    if !config.store.is_empty() {
        debug!(options = ?config.store.keys().collect::<Vec<_>>(), "store options");
    }

    let store = MemoryStore::load_file(tasks)
        .await
        .map_err(|e| miette::miette!("failed to load tasks from {}: {}", tasks.display(), e))?;
    let scheduler = Scheduler::new(&config).map_err(|e| miette::miette!("{}", e))?;
    let registry = jobs::builtin();
    info!(jobs = ?registry.names(), "registered jobs");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let sink: Arc<dyn TaskSink> = store.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx, sink).await })
    };

    let feed = ChangeFeed::new(store.clone(), registry, scheduler);
    let feed_result = feed.run(shutdown_rx).await;
    if let Err(ref e) = feed_result {
        error!(error = %e, "change feed failed");
        let _ = shutdown_tx.send(true);
    }

    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }

    if save {
        store
            .save_file(tasks)
            .await
            .map_err(|e| miette::miette!("failed to save tasks to {}: {}", tasks.display(), e))?;
    }

    feed_result.map_err(|e| miette::miette!("{}", e))?;
    info!("dlay stopped");
    Ok(())
}

/// Parse `tasks` and print one line per task.
///
/// Fails when the file cannot be read or names a job that does not exist.
pub async fn validate(tasks: &Path) -> Result<()> {
    let store = MemoryStore::load_file(tasks)
        .await
        .map_err(|e| miette::miette!("failed to load tasks from {}: {}", tasks.display(), e))?;
    let registry = jobs::builtin();
    let now = Utc::now();

    let tasks = store.list().await.map_err(|e| miette::miette!("{}", e))?;
    let mut unknown = Vec::new();

    for task in &tasks {
        let note = if !registry.contains(&task.job) {
            unknown.push(task.id.clone());
            "unknown job"
        } else if task.status.is_terminal() {
            "finished"
        } else if task.status == TaskStatus::Running {
            "running"
        } else if task.date <= now {
            "overdue"
        } else {
            "pending"
        };
        println!(
            "{:<24} {:<10} {:<10} {} ({})",
            task.id, task.job, task.status, task.date, note
        );
    }

    if !unknown.is_empty() {
        return Err(miette::miette!(
            "{} task(s) reference unknown jobs: {}",
            unknown.len(),
            unknown.join(", ")
        ));
    }

    println!("{} task(s) OK", tasks.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_tasks(dir: &TempDir, json: &str) -> std::path::PathBuf {
        let path = dir.path().join("tasks.json");
        tokio::fs::write(&path, json).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_validate_accepts_known_jobs() {
        let dir = TempDir::new().unwrap();
        let path = write_tasks(
            &dir,
            r#"[
                {"id": "a", "job": "echo", "date": "2030-01-01T00:00:00Z", "data": "hi"},
                {"id": "b", "job": "noop", "date": "2020-01-01T00:00:00Z", "status": "complete"}
            ]"#,
        )
        .await;

        assert!(validate(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_job() {
        let dir = TempDir::new().unwrap();
        let path = write_tasks(
            &dir,
            r#"[{"id": "a", "job": "encode", "date": "2030-01-01T00:00:00Z"}]"#,
        )
        .await;

        assert!(validate(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = write_tasks(&dir, r#"[{"id": "a"}]"#).await;

        assert!(validate(&path).await.is_err());
    }
}
