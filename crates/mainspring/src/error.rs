//! Scheduler error types.

use std::any::Any;
use std::thread;
use std::time::Duration;

/// Result type returned when observing a task's outcome
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Failure captured from a task body that panicked
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
    thread: Option<String>,
}

impl TaskFailure {
    /// Create a failure with an explicit message
    pub fn new(message: impl Into<String>, thread: Option<String>) -> Self {
        Self {
            message: message.into(),
            thread,
        }
    }

    /// Build a failure from a panic payload caught on the current thread
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self {
            message: panic_message(payload),
            thread: thread::current().name().map(str::to_string),
        }
    }

    /// The panic message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Name of the thread the task was running on, if it had one
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// An executor refused to accept a unit of work
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("submission rejected: {reason}")]
pub struct RejectedError {
    reason: String,
}

impl RejectedError {
    /// Create a rejection with a reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Rejection caused by the named component having been shut down
    pub fn shut_down(component: &str) -> Self {
        Self::new(format!("{} is shut down", component))
    }

    /// Why the work was refused
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Errors observed through a [`TaskHandle`](crate::TaskHandle)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The task body panicked
    #[error("task execution failed: {0}")]
    ExecutionFailed(TaskFailure),

    /// A wait on the main thread exceeded its bound
    #[error("waited {waited:?} for a task on the main thread; refusing to block it any longer")]
    MainThreadBlocked {
        /// How long the caller was blocked before giving up
        waited: Duration,
    },

    /// The requested combination is not supported
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A repeating task could not be re-armed and will not fire again
    #[error("repeating task stopped: {0}")]
    ReArmFailure(String),

    /// The task was cancelled before it produced a result
    #[error("task was cancelled")]
    Cancelled,

    /// A caller-supplied wait bound elapsed
    #[error("timed out after {waited:?} waiting for the task")]
    Timeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// The task could not be submitted
    #[error(transparent)]
    Rejected(#[from] RejectedError),
}

/// Invalid scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The scheduler name is used for thread names and must not be empty
    #[error("scheduler name must not be empty")]
    EmptyName,

    /// A zero main-thread bound would fail every wait on the main thread
    #[error("main thread wait bound must be greater than zero")]
    ZeroMainThreadWait,
}

/// Errors raised while constructing a scheduler
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A scheduler thread could not be spawned
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        /// Name of the thread that failed to start
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}
