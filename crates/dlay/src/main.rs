//! dlay: time-bucketed task runner
//!
//! Main binary with subcommands:
//! - `run`: Load a task file and run the scheduler until Ctrl-C
//! - `validate`: Check a task file without running anything

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dlay_scheduler::{DEFAULT_PRECISION_MS, SchedulerConfig};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;
mod jobs;

/// Prefix of environment variables forwarded to the task store.
const STORE_ENV_PREFIX: &str = "DLAY_STORE_";

#[derive(Parser)]
#[command(name = "dlay")]
#[command(about = "Time-bucketed task scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler over a task file
    Run {
        /// JSON file holding an array of tasks
        #[arg(long, env = "DLAY_TASKS")]
        tasks: PathBuf,

        /// Bucket width in milliseconds
        #[arg(long, env = "DLAY_PRECISION", default_value_t = DEFAULT_PRECISION_MS)]
        precision: u64,

        /// Write the final task states back to the task file on shutdown
        #[arg(long)]
        save: bool,
    },

    /// Parse a task file and report what would be scheduled
    Validate {
        /// JSON file holding an array of tasks
        #[arg(long, env = "DLAY_TASKS")]
        tasks: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dlay=info,dlay_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            tasks,
            precision,
            save,
        } => {
            let config = SchedulerConfig {
                precision_ms: precision,
                store: store_options(std::env::vars()),
            };
            daemon::run(&tasks, config, save).await
        }

        Commands::Validate { tasks } => daemon::validate(&tasks).await,
    }
}

/// Collect `DLAY_STORE_*` variables as lowercase store options.
fn store_options(vars: impl IntoIterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(STORE_ENV_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_lowercase(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_options_from_env() {
        let vars = [
            ("DLAY_STORE_DATABASE".to_string(), "dlay_tasks".to_string()),
            ("DLAY_STORE_HOST".to_string(), "localhost".to_string()),
            ("DLAY_STORE_".to_string(), "ignored".to_string()),
            ("DLAY_PRECISION".to_string(), "500".to_string()),
        ];

        let options = store_options(vars);

        assert_eq!(options.len(), 2);
        assert_eq!(options["database"], "dlay_tasks");
        assert_eq!(options["host"], "localhost");
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "dlay",
            "run",
            "--tasks",
            "tasks.json",
            "--precision",
            "250",
            "--save",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                tasks,
                precision,
                save,
            } => {
                assert_eq!(tasks, PathBuf::from("tasks.json"));
                assert_eq!(precision, 250);
                assert!(save);
            }
            Commands::Validate { .. } => panic!("expected run"),
        }
    }
}
