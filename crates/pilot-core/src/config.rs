//! Scheduler configuration: the knobs named in the engine's external
//! interface. `pilot-cli` is responsible for resolving these from
//! flags/env/file/default; this module only validates the resolved
//! values.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Parallel,
    Sequential,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_concurrent must be >= 1, got {0}")]
    MaxConcurrentZero(usize),
    #[error("interval must be >= 10s, got {0:?}")]
    IntervalTooShort(Duration),
}

#[derive(Debug, Clone)]
pub struct StaleCleanupConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub threshold: Duration,
}

impl Default for StaleCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30 * 60),
            threshold: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: Mode,
    pub max_concurrent: usize,
    pub interval: Duration,
    pub selector: String,
    pub wait_for_merge: bool,
    pub mr_poll_interval: Duration,
    pub mr_timeout: Duration,
    pub sequential_backoff: Duration,
    pub stale_cleanup: StaleCleanupConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Parallel,
            max_concurrent: 2,
            interval: Duration::from_secs(60),
            selector: "pilot".to_owned(),
            wait_for_merge: true,
            mr_poll_interval: Duration::from_secs(30),
            mr_timeout: Duration::from_secs(60 * 60),
            sequential_backoff: Duration::from_secs(5 * 60),
            stale_cleanup: StaleCleanupConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::MaxConcurrentZero(self.max_concurrent));
        }
        if self.interval < Duration::from_secs(10) {
            return Err(ConfigError::IntervalTooShort(self.interval));
        }
        Ok(())
    }
}
