//! Task handles and the pending results behind them
//!
//! A [`Completion`] is the result sink shared between the job running a task
//! and every [`TaskHandle`] clone. It settles at most once: the first of
//! "body finished", "body panicked", "cancelled" or "schedule terminated"
//! wins, and every later observer sees that same outcome.
//!
//! Waiting is domain-aware. A wait made on the host's main thread is bounded
//! by `main_thread_wait` and fails with
//! [`SchedulerError::MainThreadBlocked`] instead of freezing the host.

use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{Domain, MainThreadCheck, Mode};
use crate::timer::Registration;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of a submitted task, unique within one scheduler
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Wrap a raw id
    pub fn from_raw(id: u64) -> Self {
        TaskId(id)
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observable state of a task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// One-shot task that has not produced a result yet
    Pending,
    /// Repeating task that is still armed
    Active,
    /// Finished with a value
    Completed,
    /// Panicked, was rejected, or its schedule died
    Failed,
    /// Cancelled before producing a result
    Cancelled,
}

/// Something that can be forced into a terminal error state
pub(crate) trait Terminate: Send + Sync {
    /// Settle with `error` unless already settled; true if this call settled it
    fn terminate(&self, error: SchedulerError) -> bool;
}

/// Shared pending result of one task
pub(crate) struct Completion<T> {
    outcome: Mutex<Option<SchedulerResult<T>>>,
    settled: Condvar,
    repeating: bool,
}

impl<T> Completion<T> {
    pub(crate) fn new(repeating: bool) -> Self {
        Self {
            outcome: Mutex::new(None),
            settled: Condvar::new(),
            repeating,
        }
    }

    /// Store the outcome if none is stored yet; true if this call stored it
    pub(crate) fn settle(&self, outcome: SchedulerResult<T>) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.settled.notify_all();
        true
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.outcome.lock().is_some()
    }

    fn state(&self) -> TaskState {
        match &*self.outcome.lock() {
            None if self.repeating => TaskState::Active,
            None => TaskState::Pending,
            Some(Ok(_)) => TaskState::Completed,
            Some(Err(SchedulerError::Cancelled)) => TaskState::Cancelled,
            Some(Err(_)) => TaskState::Failed,
        }
    }
}

impl<T: Clone> Completion<T> {
    /// Block until settled
    fn wait(&self) -> SchedulerResult<T> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = &*slot {
                return outcome.clone();
            }
            self.settled.wait(&mut slot);
        }
    }

    /// Block until settled or `deadline` passes
    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<SchedulerResult<T>> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = &*slot {
                return Some(outcome.clone());
            }
            if self.settled.wait_until(&mut slot, deadline).timed_out() {
                return (*slot).clone();
            }
        }
    }
}

impl<T: Send> Terminate for Completion<T> {
    fn terminate(&self, error: SchedulerError) -> bool {
        self.settle(Err(error))
    }
}

/// Handle to a submitted task
///
/// Clones share the same pending result, so one thread can wait while another
/// cancels.
pub struct TaskHandle<T> {
    id: TaskId,
    domain: Domain,
    mode: Mode,
    completion: Arc<Completion<T>>,
    registration: Option<Arc<Registration>>,
    main_thread: Arc<dyn MainThreadCheck>,
    main_thread_wait: Duration,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        id: TaskId,
        domain: Domain,
        mode: Mode,
        completion: Arc<Completion<T>>,
        registration: Option<Arc<Registration>>,
        main_thread: Arc<dyn MainThreadCheck>,
        main_thread_wait: Duration,
    ) -> Self {
        Self {
            id,
            domain,
            mode,
            completion,
            registration,
            main_thread,
            main_thread_wait,
        }
    }

    /// Get the task ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Domain the task runs in
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// How the task was scheduled
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// True if the task runs on the worker pool
    pub fn is_async(&self) -> bool {
        self.domain.is_async()
    }

    /// True for periodic tasks
    pub fn is_repeatable(&self) -> bool {
        self.mode.is_repeating()
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.completion.state()
    }

    /// True once the handle reached a terminal state
    pub fn is_done(&self) -> bool {
        self.completion.is_settled()
    }

    /// Request cancellation.
    ///
    /// Work that is already running is not interrupted; queued and future
    /// firings are skipped. Returns true if this call cancelled the task,
    /// false if it had already finished or been cancelled.
    pub fn cancel(&self) -> bool {
        if let Some(registration) = &self.registration {
            registration.cancel();
        }
        let cancelled = self.completion.settle(Err(SchedulerError::Cancelled));
        if cancelled {
            tracing::trace!(task = %self.id, domain = %self.domain, "task cancelled");
        }
        cancelled
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Block until the task finishes and return its outcome.
    ///
    /// On the main thread the wait is bounded by the scheduler's
    /// `main_thread_wait` and fails with [`SchedulerError::MainThreadBlocked`]
    /// when the bound is exceeded. Elsewhere it blocks until the task settles.
    /// A repeating task settles only when cancelled or when its schedule dies.
    pub fn wait(&self) -> SchedulerResult<T> {
        self.wait_bounded(None)
    }

    /// Like [`wait`](Self::wait), giving up with [`SchedulerError::Timeout`]
    /// after `limit`. The main-thread bound still applies when it is shorter.
    pub fn wait_timeout(&self, limit: Duration) -> SchedulerResult<T> {
        self.wait_bounded(Some(limit))
    }

    /// Wait without the main-thread guard.
    ///
    /// Refused for sync tasks: their result is produced by the main thread, so
    /// waiting for it there without a bound can never finish.
    pub fn wait_forced(&self) -> SchedulerResult<T> {
        if self.domain == Domain::Sync {
            return Err(SchedulerError::Unsupported(
                "forced wait on a task bound to the main thread",
            ));
        }
        self.completion.wait()
    }

    fn wait_bounded(&self, limit: Option<Duration>) -> SchedulerResult<T> {
        let start = Instant::now();

        if self.main_thread.is_main_thread() {
            let guard = self.main_thread_wait;
            if limit.map_or(true, |limit| guard <= limit) {
                // A bound too large to represent never expires
                let Some(deadline) = start.checked_add(guard) else {
                    return self.completion.wait();
                };
                return self.completion.wait_until(deadline).unwrap_or_else(|| {
                    Err(SchedulerError::MainThreadBlocked {
                        waited: start.elapsed(),
                    })
                });
            }
        }

        match limit {
            None => self.completion.wait(),
            Some(limit) => match start.checked_add(limit) {
                Some(deadline) => self.completion.wait_until(deadline).unwrap_or_else(|| {
                    Err(SchedulerError::Timeout {
                        waited: start.elapsed(),
                    })
                }),
                None => self.completion.wait(),
            },
        }
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            domain: self.domain,
            mode: self.mode,
            completion: Arc::clone(&self.completion),
            registration: self.registration.clone(),
            main_thread: Arc::clone(&self.main_thread),
            main_thread_wait: self.main_thread_wait,
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
