//! Fixed-size worker pool backing the async domain
//!
//! Workers pull jobs from a shared unbounded channel. Closing the pool drops
//! the sender: queued jobs still drain, then each worker sees the channel
//! disconnect and exits.

use crate::diagnostics::{DiagnosticLogger, ThreadRegistry};
use crate::error::{panic_message, BuildError, RejectedError};
use crate::executor::{Executor, Job};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Worker threads named `<name>-<n>`
pub(crate) struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Numbering is per pool, so two schedulers both start at `-0`
    next_thread: AtomicUsize,
    registry: Arc<ThreadRegistry>,
    logger: Arc<dyn DiagnosticLogger>,
}

impl WorkerPool {
    /// Start `parallelism` workers
    pub(crate) fn new(
        name: &str,
        parallelism: usize,
        registry: Arc<ThreadRegistry>,
        logger: Arc<dyn DiagnosticLogger>,
    ) -> Result<Self, BuildError> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let pool = Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(Vec::with_capacity(parallelism)),
            next_thread: AtomicUsize::new(0),
            registry,
            logger,
        };

        for _ in 0..parallelism.max(1) {
            // On failure `pool` drops here, closing the channel so the
            // workers already started exit on their own
            pool.spawn_worker(receiver.clone())?;
        }

        tracing::debug!(pool = %pool.name, workers = pool.handles.lock().len(), "worker pool started");
        Ok(pool)
    }

    fn spawn_worker(&self, receiver: Receiver<Job>) -> Result<(), BuildError> {
        let thread_name = format!("{}-{}", self.name, self.next_thread.fetch_add(1, Ordering::Relaxed));
        let registry = Arc::clone(&self.registry);
        let logger = Arc::clone(&self.logger);

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || Self::worker_loop(receiver, registry, logger))
            .map_err(|source| BuildError::Spawn {
                name: thread_name,
                source,
            })?;

        self.handles.lock().push(handle);
        Ok(())
    }

    fn worker_loop(
        receiver: Receiver<Job>,
        registry: Arc<ThreadRegistry>,
        logger: Arc<dyn DiagnosticLogger>,
    ) {
        let _registered = registry.register_current();
        let untracked = Arc::new(Backtrace::disabled());

        // Runs until the pool closes and the queue is empty
        for job in receiver.iter() {
            let _activity = registry.enter(None, Arc::clone(&untracked));
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                let current = thread::current();
                logger.warn(&format!(
                    "Thread {} panicked while running a job: {}",
                    current.name().unwrap_or("<unnamed>"),
                    panic_message(payload.as_ref())
                ));
            }
        }
    }

    /// Number of worker threads
    pub(crate) fn parallelism(&self) -> usize {
        self.handles.lock().len()
    }

    /// Stop accepting jobs and wait up to `grace` for the workers to finish
    /// everything already queued. Returns false if any worker is still
    /// running at the deadline; those threads are detached.
    pub(crate) fn shutdown(&self, grace: Duration) -> bool {
        self.sender.lock().take();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        // A grace too large to represent means wait for as long as it takes
        let deadline = Instant::now().checked_add(grace);

        let mut all_joined = true;
        for handle in handles {
            all_joined &= join_with_timeout(handle, deadline);
        }

        if all_joined {
            tracing::debug!(pool = %self.name, "worker pool terminated");
        }
        all_joined
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| RejectedError::shut_down(&format!("worker pool {}", self.name)))?;
        sender
            .send(job)
            .map_err(|_| RejectedError::new(format!("worker pool {} has no live workers", self.name)))
    }
}

/// Join a thread unless `deadline` passes first, in which case it is detached.
/// Without a deadline the join is unbounded. Returns true if the thread was
/// joined.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, deadline: Option<Instant>) -> bool {
    let Some(deadline) = deadline else {
        let _ = handle.join();
        return true;
    };
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return true;
        }
        if Instant::now() >= deadline {
            drop(handle);
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
