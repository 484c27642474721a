//! Background worker configuration.
//!
//! `naptime_secs` and `enabled` are re-read whenever the worker receives a
//! reload request; the remaining fields only apply at startup.
//!
//! # Example
//!
//! ```toml
//! [worker]
//! naptime_secs = 60
//! enabled = true
//! max_workers = 1
//! autostart = true
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Lower bound for the cleanup interval.
pub const MIN_NAPTIME_SECS: u64 = 1;

/// Upper bound for the cleanup interval, the largest value a signed 32-bit
/// setting can hold.
pub const MAX_NAPTIME_SECS: u64 = i32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Seconds between scheduled cleanup passes.
    /// Default: 60
    #[serde(default = "default_naptime_secs")]
    pub naptime_secs: u64,

    /// Whether the worker runs cleanup passes at all. A disabled worker
    /// keeps waking up but skips every pass.
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Worker slots of the in-process supervisor used by `serve`.
    ///
    /// `serve` hosts workers for its one configured database, and only one
    /// worker per database can be registered at a time. A second slot can
    /// only hold a worker that exits with `AlreadyRunning`, so values above
    /// 1 don't run more cleanup.
    /// Default: 1
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Start the worker as soon as `serve` boots.
    /// Default: true
    #[serde(default = "default_true")]
    pub autostart: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            naptime_secs: default_naptime_secs(),
            enabled: true,
            max_workers: default_max_workers(),
            autostart: true,
        }
    }
}

fn default_naptime_secs() -> u64 {
    60
}

fn default_max_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_NAPTIME_SECS..=MAX_NAPTIME_SECS).contains(&self.naptime_secs) {
            return Err(ConfigError::Validation(format!(
                "worker.naptime_secs must be between {MIN_NAPTIME_SECS} and {MAX_NAPTIME_SECS}"
            )));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Validation(
                "worker.max_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The reloadable subset of this section.
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            naptime: Duration::from_secs(
                self.naptime_secs.clamp(MIN_NAPTIME_SECS, MAX_NAPTIME_SECS),
            ),
            enabled: self.enabled,
        }
    }
}

/// Runtime settings the worker re-reads on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub naptime: Duration,
    pub enabled: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerConfig::default().settings()
    }
}
