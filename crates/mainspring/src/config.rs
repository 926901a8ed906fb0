//! Construction-time scheduler settings

use crate::error::ConfigError;
use std::time::Duration;

/// Default bound on each shutdown phase
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Default bound on a wait made from the main thread
pub const DEFAULT_MAIN_THREAD_WAIT: Duration = Duration::from_millis(50);

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Timer thread name, and prefix for worker thread names (`<name>-<n>`)
    pub name: String,

    /// Worker pool size (0 = number of CPU cores)
    pub parallelism: usize,

    /// How long each shutdown phase waits before reporting stuck threads
    pub shutdown_grace: Duration,

    /// How long a wait made on the main thread may block
    pub main_thread_wait: Duration,
}

impl SchedulerConfig {
    /// Create a configuration with the given name and default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the worker pool size
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the per-phase shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the main-thread wait bound
    pub fn with_main_thread_wait(mut self, bound: Duration) -> Self {
        self.main_thread_wait = bound;
        self
    }

    /// Number of worker threads the pool will start
    pub fn worker_count(&self) -> usize {
        if self.parallelism == 0 {
            num_cpus::get()
        } else {
            self.parallelism
        }
    }

    /// Prefix shared by every worker thread name
    pub fn worker_prefix(&self) -> String {
        format!("{}-", self.name)
    }

    /// Check the configuration for values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.main_thread_wait.is_zero() {
            return Err(ConfigError::ZeroMainThreadWait);
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            parallelism: 0,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            main_thread_wait: DEFAULT_MAIN_THREAD_WAIT,
        }
    }
}
