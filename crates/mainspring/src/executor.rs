//! Execution domains and the capabilities a host supplies
//!
//! An executor only has to accept a [`Job`] and run it eventually. The
//! scheduler wraps every task body into a job that settles the task's
//! pending result, so executors never see task values or errors.

use crate::error::RejectedError;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// A unit of work handed to an executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Submission capability of an execution domain
pub trait Executor: Send + Sync {
    /// Queue `job` for execution. Must not block waiting for the job to run.
    fn execute(&self, job: Job) -> Result<(), RejectedError>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        (**self).execute(job)
    }
}

/// Tells whether the calling thread is the host's main execution context
pub trait MainThreadCheck: Send + Sync {
    /// True when called from the main context
    fn is_main_thread(&self) -> bool;
}

impl<F> MainThreadCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_main_thread(&self) -> bool {
        self()
    }
}

/// Identity of the thread acting as the main context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainThreadId(ThreadId);

impl MainThreadId {
    /// Treat the calling thread as the main context
    pub fn current() -> Self {
        MainThreadId(thread::current().id())
    }

    /// The underlying thread id
    pub fn id(&self) -> ThreadId {
        self.0
    }
}

impl MainThreadCheck for MainThreadId {
    fn is_main_thread(&self) -> bool {
        thread::current().id() == self.0
    }
}

/// Where a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// The host's main execution context
    Sync,
    /// The scheduler's worker pool
    Async,
}

impl Domain {
    /// True for the worker pool domain
    pub fn is_async(self) -> bool {
        matches!(self, Domain::Async)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Sync => write!(f, "sync"),
            Domain::Async => write!(f, "async"),
        }
    }
}

/// When a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Submitted right away
    Immediate,
    /// Submitted once after a delay
    Delayed(Duration),
    /// Submitted every interval until cancelled
    Repeating(Duration),
}

impl Mode {
    /// True for periodic tasks
    pub fn is_repeating(self) -> bool {
        matches!(self, Mode::Repeating(_))
    }
}
