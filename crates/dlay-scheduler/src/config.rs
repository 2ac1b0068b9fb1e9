//! Scheduler configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Default bucket width in milliseconds.
pub const DEFAULT_PRECISION_MS: u64 = 1000;

/// Configuration recognised by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Width of a dispatch bucket in milliseconds.
    ///
    /// Due dates inside one bucket share a single timer. Larger values bound
    /// the number of live timers at the cost of firing up to one bucket
    /// early.
    #[serde(default = "default_precision_ms")]
    pub precision_ms: u64,

    /// Store connection parameters, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub store: BTreeMap<String, String>,
}

fn default_precision_ms() -> u64 {
    DEFAULT_PRECISION_MS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            precision_ms: DEFAULT_PRECISION_MS,
            store: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Configuration with the given bucket width.
    pub fn with_precision_ms(precision_ms: u64) -> Self {
        Self {
            precision_ms,
            ..Self::default()
        }
    }

    /// Add an opaque store parameter.
    pub fn store_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.store.insert(key.into(), value.into());
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.precision_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "precision_ms must be greater than zero".to_string(),
            ));
        }
        if i64::try_from(self.precision_ms).is_err() {
            return Err(SchedulerError::InvalidConfig(format!(
                "precision_ms {} is out of range",
                self.precision_ms
            )));
        }
        Ok(())
    }

    pub fn precision(&self) -> Duration {
        Duration::from_millis(self.precision_ms)
    }
}
