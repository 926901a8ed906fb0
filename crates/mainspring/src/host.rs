//! Ready-made main context for hosts that own a tick loop
//!
//! [`MainLoop`] queues sync-domain jobs and runs them when the owning thread
//! calls [`run_pending`](MainLoop::run_pending) or
//! [`run_for`](MainLoop::run_for). It serves as both the sync executor and
//! the main-thread check:
//!
//! ```ignore
//! let host = Arc::new(MainLoop::new());
//! let scheduler = Scheduler::builder(host.clone(), host.clone()).build()?;
//! ```

use crate::error::{panic_message, RejectedError};
use crate::executor::{Executor, Job, MainThreadCheck, MainThreadId};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Job queue drained by the thread that created it
pub struct MainLoop {
    owner: MainThreadId,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    closed: AtomicBool,
}

impl MainLoop {
    /// Create a loop owned by the calling thread
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            owner: MainThreadId::current(),
            sender,
            receiver,
            closed: AtomicBool::new(false),
        }
    }

    /// The thread that runs queued jobs
    pub fn owner(&self) -> MainThreadId {
        self.owner
    }

    /// Jobs waiting to run
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Run the jobs queued so far; returns how many ran.
    ///
    /// Jobs queued while draining wait for the next call. Does nothing off
    /// the owning thread.
    pub fn run_pending(&self) -> usize {
        if !self.owner.is_main_thread() {
            tracing::debug!("run_pending called off the main loop's owning thread");
            return 0;
        }

        let queued = self.receiver.len();
        let mut ran = 0;
        for _ in 0..queued {
            match self.receiver.try_recv() {
                Ok(job) => {
                    run_job(job);
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    /// Keep running jobs as they arrive until `budget` elapses; returns how
    /// many ran
    pub fn run_for(&self, budget: Duration) -> usize {
        if !self.owner.is_main_thread() {
            return 0;
        }

        // A budget too large to represent runs until the queue disconnects
        let deadline = Instant::now().checked_add(budget);
        let mut ran = 0;
        loop {
            let next = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    self.receiver.recv_timeout(remaining)
                }
                None => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(job) => {
                    run_job(job);
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) => break,
                // Unreachable while `self` holds the sender
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        ran
    }

    /// Refuse further jobs. Jobs already queued can still be run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::warn!(panic = %panic_message(payload.as_ref()), "main loop job panicked");
    }
}

impl Executor for MainLoop {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        if self.is_closed() {
            return Err(RejectedError::shut_down("main loop"));
        }
        self.sender
            .send(job)
            .map_err(|_| RejectedError::new("main loop queue is gone"))
    }
}

impl MainThreadCheck for MainLoop {
    fn is_main_thread(&self) -> bool {
        self.owner.is_main_thread()
    }
}
