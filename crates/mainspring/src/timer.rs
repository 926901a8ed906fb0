//! Timer thread for delayed and repeating submissions
//!
//! The timer only decides *when*. At each deadline it hands a job to the
//! target executor and moves on; task bodies never run on this thread.
//! Repeating entries are re-armed at a fixed rate from their previous
//! deadline, independent of whether the previous submission finished.

use crate::diagnostics::{DiagnosticLogger, ThreadRegistry};
use crate::error::{panic_message, BuildError, RejectedError, SchedulerError};
use crate::executor::{Executor, Job};
use crate::handle::{TaskId, Terminate};
use crate::pool::join_with_timeout;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::backtrace::Backtrace;
use std::cmp::Ordering;
use std::collections::binary_heap::{BinaryHeap, PeekMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Builds a fresh job for every firing of a repeating entry
pub(crate) type JobFactory = Arc<dyn Fn() -> Job + Send + Sync>;

/// Cancellable arming of one task on the timer.
///
/// A repeating task keeps the same registration across re-arms, so
/// cancelling it always reaches the current arming.
pub(crate) struct Registration {
    task: TaskId,
    cancelled: AtomicBool,
    origin: Arc<Backtrace>,
    completion: Arc<dyn Terminate>,
    /// Timer holding the armed entry, set when armed
    timer: Mutex<Weak<TimerThread>>,
}

impl Registration {
    pub(crate) fn new(task: TaskId, origin: Arc<Backtrace>, completion: Arc<dyn Terminate>) -> Self {
        Self {
            task,
            cancelled: AtomicBool::new(false),
            origin,
            completion,
            timer: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn task(&self) -> TaskId {
        self.task
    }

    /// Prevent future firings and drop the armed entry from the timer; true
    /// if this call cancelled it
    pub(crate) fn cancel(&self) -> bool {
        if !self.mark_cancelled() {
            return false;
        }
        let timer = self.timer.lock().upgrade();
        if let Some(timer) = timer {
            timer.purge_cancelled();
        }
        true
    }

    /// Set the flag only. Used where the entry is already out of the heap
    /// and the timer lock may be held.
    fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, AtomicOrdering::AcqRel)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Stop the schedule and settle the task with `error`
    fn terminate(&self, error: SchedulerError) {
        self.mark_cancelled();
        self.completion.terminate(error);
    }
}

enum Firing {
    Once(Job),
    Repeating { interval: Duration, make_job: JobFactory },
}

/// Entry in the timer heap
struct TimerEntry {
    deadline: Instant,
    /// Arming order, breaks ties between equal deadlines
    seq: u64,
    registration: Arc<Registration>,
    executor: Arc<dyn Executor>,
    firing: Firing,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerState {
    armed: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerState {
    fn push(&mut self, mut entry: TimerEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.armed.push(entry);
    }
}

/// Single dedicated thread firing delayed and repeating submissions
pub(crate) struct TimerThread {
    name: String,
    state: Mutex<TimerState>,
    /// Wakes the timer thread when an earlier entry is armed or on shutdown
    notify: Condvar,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<ThreadRegistry>,
    logger: Arc<dyn DiagnosticLogger>,
    rearm_failures: AtomicU64,
    /// Delayed submissions the executor refused at their deadline
    rejected_dispatches: AtomicU64,
}

impl TimerThread {
    /// Spawn the timer thread, named `name`
    pub(crate) fn start(
        name: &str,
        registry: Arc<ThreadRegistry>,
        logger: Arc<dyn DiagnosticLogger>,
    ) -> Result<Arc<Self>, BuildError> {
        let timer = Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(TimerState {
                armed: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
            registry,
            logger,
            rearm_failures: AtomicU64::new(0),
            rejected_dispatches: AtomicU64::new(0),
        });

        let runner = Arc::clone(&timer);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runner.run_loop())
            .map_err(|source| BuildError::Spawn {
                name: name.to_string(),
                source,
            })?;

        *timer.handle.lock() = Some(handle);
        Ok(timer)
    }

    /// Submit `job` to `executor` once, after `delay`
    pub(crate) fn schedule_once(
        self: &Arc<Self>,
        executor: Arc<dyn Executor>,
        job: Job,
        delay: Duration,
        registration: Arc<Registration>,
    ) -> Result<(), RejectedError> {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or_else(|| RejectedError::new(format!("delay of {:?} is out of range", delay)))?;
        self.arm(deadline, registration, executor, Firing::Once(job))
    }

    /// Submit a fresh job from `make_job` to `executor` every `interval`,
    /// starting one interval from now
    pub(crate) fn schedule_repeating(
        self: &Arc<Self>,
        executor: Arc<dyn Executor>,
        make_job: JobFactory,
        interval: Duration,
        registration: Arc<Registration>,
    ) -> Result<(), RejectedError> {
        let deadline = Instant::now().checked_add(interval).ok_or_else(|| {
            RejectedError::new(format!("interval of {:?} is out of range", interval))
        })?;
        self.arm(
            deadline,
            registration,
            executor,
            Firing::Repeating { interval, make_job },
        )
    }

    fn arm(
        self: &Arc<Self>,
        deadline: Instant,
        registration: Arc<Registration>,
        executor: Arc<dyn Executor>,
        firing: Firing,
    ) -> Result<(), RejectedError> {
        *registration.timer.lock() = Arc::downgrade(self);

        let mut state = self.state.lock();
        if self.shutdown.load(AtomicOrdering::Acquire) {
            return Err(RejectedError::shut_down(&format!("timer {}", self.name)));
        }

        tracing::trace!(timer = %self.name, task = %registration.task(), "armed");
        state.push(TimerEntry {
            deadline,
            seq: 0,
            registration,
            executor,
            firing,
        });
        // The new entry may be earlier than the one the thread is sleeping on
        self.notify.notify_one();
        Ok(())
    }

    /// Drop cancelled entries so their jobs are released before their deadline
    fn purge_cancelled(&self) {
        let mut state = self.state.lock();
        let before = state.armed.len();
        state.armed.retain(|entry| !entry.registration.is_cancelled());
        let purged = before - state.armed.len();
        if purged > 0 {
            tracing::trace!(timer = %self.name, purged, "purged cancelled entries");
        }
    }

    /// Timer thread main loop
    fn run_loop(&self) {
        let _registered = self.registry.register_current();
        tracing::debug!(timer = %self.name, "timer thread started");

        let mut state = self.state.lock();
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = state.armed.peek_mut() {
                if entry.deadline > now {
                    break;
                }
                due.push(PeekMut::pop(entry));
            }

            if !due.is_empty() {
                // Dispatch without the lock so a slow executor never blocks arming
                let rearmed: Vec<TimerEntry> = MutexGuard::unlocked(&mut state, || {
                    due.into_iter().filter_map(|entry| self.fire(entry)).collect()
                });

                for entry in rearmed {
                    if self.shutdown.load(AtomicOrdering::Acquire) {
                        entry.registration.terminate(SchedulerError::Cancelled);
                    } else if !entry.registration.is_cancelled() {
                        // Cancelled mid-dispatch, after the purge missed it
                        state.push(entry);
                    }
                }
                continue;
            }

            match state.armed.peek().map(|entry| entry.deadline) {
                Some(deadline) => {
                    self.notify.wait_until(&mut state, deadline);
                }
                None => self.notify.wait(&mut state),
            }
        }

        drop(state);
        tracing::debug!(timer = %self.name, "timer thread shutting down");
    }

    /// Hand one due entry to its executor; returns the entry re-armed for its
    /// next firing if it repeats
    fn fire(&self, entry: TimerEntry) -> Option<TimerEntry> {
        if entry.registration.is_cancelled() {
            tracing::trace!(
                timer = %self.name,
                task = %entry.registration.task(),
                "dropping cancelled entry"
            );
            return None;
        }
        if self.shutdown.load(AtomicOrdering::Acquire) {
            entry.registration.terminate(SchedulerError::Cancelled);
            return None;
        }

        let _activity = self
            .registry
            .enter(Some(entry.registration.task()), Arc::clone(&entry.registration.origin));

        match entry.firing {
            Firing::Once(job) => {
                let refused = match dispatch(&*entry.executor, || job) {
                    Ok(()) => None,
                    Err(Dispatch::Refused(err)) => Some(err),
                    Err(Dispatch::Panicked(message)) => {
                        self.logger.severe(&format!(
                            "Executor panicked while accepting delayed task {} on {}: {}",
                            entry.registration.task(),
                            self.name,
                            message
                        ));
                        Some(RejectedError::new(format!("executor panicked: {}", message)))
                    }
                };

                if let Some(err) = refused {
                    tracing::debug!(
                        timer = %self.name,
                        task = %entry.registration.task(),
                        %err,
                        "delayed submission rejected"
                    );
                    self.rejected_dispatches.fetch_add(1, AtomicOrdering::Relaxed);
                    entry.registration.terminate(SchedulerError::Rejected(err));
                }
                None
            }
            Firing::Repeating { interval, make_job } => {
                let next = match dispatch(&*entry.executor, || make_job()) {
                    // Fixed rate: next deadline counts from this deadline, not from now
                    Ok(()) => entry.deadline.checked_add(interval).ok_or_else(|| {
                        format!("next deadline {:?} after the last one is out of range", interval)
                    }),
                    Err(Dispatch::Refused(err)) => {
                        Err(format!("executor refused the firing: {}", err.reason()))
                    }
                    Err(Dispatch::Panicked(message)) => {
                        Err(format!("executor panicked while accepting the firing: {}", message))
                    }
                };

                match next {
                    Ok(deadline) => Some(TimerEntry {
                        deadline,
                        seq: 0,
                        registration: entry.registration,
                        executor: entry.executor,
                        firing: Firing::Repeating { interval, make_job },
                    }),
                    Err(reason) => {
                        self.rearm_failed(&entry.registration, reason);
                        None
                    }
                }
            }
        }
    }

    fn rearm_failed(&self, registration: &Registration, reason: String) {
        self.rearm_failures.fetch_add(1, AtomicOrdering::Relaxed);
        self.logger.severe(&format!(
            "Repeating task {} on {} will not fire again: {}",
            registration.task(),
            self.name,
            reason
        ));
        registration.terminate(SchedulerError::ReArmFailure(reason));
    }

    /// Stop accepting arm requests, cancel everything still armed and wait up
    /// to `grace` for the thread to exit. Returns false if it did not.
    pub(crate) fn stop(&self, grace: Duration) -> bool {
        let abandoned = {
            let mut state = self.state.lock();
            self.shutdown.store(true, AtomicOrdering::Release);
            std::mem::take(&mut state.armed).into_vec()
        };
        self.notify.notify_all();

        if !abandoned.is_empty() {
            tracing::debug!(timer = %self.name, count = abandoned.len(), "cancelling armed tasks");
        }
        for entry in abandoned {
            entry.registration.terminate(SchedulerError::Cancelled);
        }

        match self.handle.lock().take() {
            Some(handle) => join_with_timeout(handle, Instant::now().checked_add(grace)),
            None => true,
        }
    }

    /// Name of the timer thread
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Number of armed, not yet cancelled entries
    pub(crate) fn armed_count(&self) -> usize {
        self.state
            .lock()
            .armed
            .iter()
            .filter(|entry| !entry.registration.is_cancelled())
            .count()
    }

    /// Repeating schedules that died while re-arming
    pub(crate) fn rearm_failures(&self) -> u64 {
        self.rearm_failures.load(AtomicOrdering::Relaxed)
    }

    /// Delayed tasks whose executor refused them at their deadline
    pub(crate) fn rejected_dispatches(&self) -> u64 {
        self.rejected_dispatches.load(AtomicOrdering::Relaxed)
    }
}

/// Why a due entry never reached its executor
enum Dispatch {
    Refused(RejectedError),
    Panicked(String),
}

/// Hand a job to an executor on the timer thread. A panic in the host's
/// executor is contained here so the timer keeps serving other entries.
fn dispatch(executor: &dyn Executor, make_job: impl FnOnce() -> Job) -> Result<(), Dispatch> {
    match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(make_job()))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Dispatch::Refused(err)),
        Err(payload) => Err(Dispatch::Panicked(panic_message(payload.as_ref()))),
    }
}
