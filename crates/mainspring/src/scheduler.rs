//! Scheduler façade over the main context, the worker pool and the timer

use crate::config::SchedulerConfig;
use crate::diagnostics::{report_stuck_threads, DiagnosticLogger, ThreadRegistry, TracingLogger};
use crate::error::{panic_message, BuildError, RejectedError, SchedulerError, TaskFailure};
use crate::executor::{Domain, Executor, Job, MainThreadCheck, Mode};
use crate::handle::{Completion, TaskHandle, TaskId, Terminate};
use crate::pool::WorkerPool;
use crate::timer::{JobFactory, Registration, TimerThread};
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks accepted for execution
    pub submitted: u64,

    /// Task bodies that returned normally (each firing of a repeating task counts)
    pub completed: u64,

    /// Task bodies that panicked
    pub failed: u64,

    /// Submissions refused by the scheduler or an executor
    pub rejected: u64,

    /// Repeating tasks stopped because they could not be re-armed
    pub rearm_failures: u64,

    /// Delayed and repeating tasks currently armed on the timer
    pub armed_timers: usize,

    /// Worker pool size
    pub worker_threads: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Builder for [`Scheduler`]
pub struct SchedulerBuilder {
    sync: Arc<dyn Executor>,
    main_thread: Arc<dyn MainThreadCheck>,
    config: SchedulerConfig,
    logger: Option<Arc<dyn DiagnosticLogger>>,
}

impl SchedulerBuilder {
    /// Replace the default configuration
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Send diagnostics somewhere other than `tracing`
    pub fn logger(mut self, logger: Arc<dyn DiagnosticLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Validate the configuration and start the timer and worker threads
    pub fn build(self) -> Result<Scheduler, BuildError> {
        self.config.validate()?;

        let name = self.config.name.clone();
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger::new(name.clone())));
        let registry = Arc::new(ThreadRegistry::new());

        let pool = Arc::new(WorkerPool::new(
            &name,
            self.config.worker_count(),
            Arc::clone(&registry),
            Arc::clone(&logger),
        )?);
        let timer = match TimerThread::start(&name, Arc::clone(&registry), Arc::clone(&logger)) {
            Ok(timer) => timer,
            Err(err) => {
                pool.shutdown(self.config.shutdown_grace);
                return Err(err);
            }
        };

        tracing::debug!(
            scheduler = %name,
            workers = pool.parallelism(),
            main_thread_wait = ?self.config.main_thread_wait,
            "scheduler started"
        );

        Ok(Scheduler {
            config: self.config,
            sync: self.sync,
            pool,
            timer,
            main_thread: self.main_thread,
            logger,
            registry,
            counters: Arc::new(Counters::default()),
            next_task_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Runs work on the host's main context or on a worker pool, immediately,
/// after a delay or at a fixed rate.
///
/// The domain is picked by method name (`*_sync` / `*_async`); everything else
/// behaves the same in both domains. Dropping the scheduler shuts it down.
pub struct Scheduler {
    config: SchedulerConfig,
    sync: Arc<dyn Executor>,
    pool: Arc<WorkerPool>,
    timer: Arc<TimerThread>,
    main_thread: Arc<dyn MainThreadCheck>,
    logger: Arc<dyn DiagnosticLogger>,
    registry: Arc<ThreadRegistry>,
    counters: Arc<Counters>,
    next_task_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Scheduler {
    /// Start building a scheduler that runs sync work on `sync` and treats
    /// threads for which `main_thread` answers true as the main context
    pub fn builder(
        sync: Arc<dyn Executor>,
        main_thread: Arc<dyn MainThreadCheck>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            sync,
            main_thread,
            config: SchedulerConfig::default(),
            logger: None,
        }
    }

    /// Run `work` on the main context
    pub fn execute_sync<T, F>(&self, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_once(Domain::Sync, None, work)
    }

    /// Run `work` on the worker pool
    pub fn execute_async<T, F>(&self, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_once(Domain::Async, None, work)
    }

    /// Run `work` on the main context once `delay` has passed
    pub fn sync_later<T, F>(&self, work: F, delay: Duration) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_once(Domain::Sync, Some(delay), work)
    }

    /// Run `work` on the worker pool once `delay` has passed
    pub fn async_later<T, F>(&self, work: F, delay: Duration) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_once(Domain::Async, Some(delay), work)
    }

    /// Run `work` on the main context every `interval`, first after one
    /// interval, until cancelled
    pub fn sync_repeating<F>(&self, work: F, interval: Duration) -> TaskHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.submit_repeating(Domain::Sync, interval, work)
    }

    /// Run `work` on the worker pool every `interval`, first after one
    /// interval, until cancelled
    pub fn async_repeating<F>(&self, work: F, interval: Duration) -> TaskHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.submit_repeating(Domain::Async, interval, work)
    }

    /// True if the calling thread is the host's main context
    pub fn is_main_thread(&self) -> bool {
        self.main_thread.is_main_thread()
    }

    /// The worker pool as a plain executor for fire-and-forget jobs.
    ///
    /// Panics in these jobs are logged and do not reach any handle.
    pub fn async_executor(&self) -> Arc<dyn Executor> {
        self.pool.clone()
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// True once [`shutdown`](Self::shutdown) has started
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            // Delayed tasks refused at their deadline count here too
            rejected: self.counters.rejected.load(Ordering::Relaxed) + self.timer.rejected_dispatches(),
            rearm_failures: self.timer.rearm_failures(),
            armed_timers: self.timer.armed_count(),
            worker_threads: self.pool.parallelism(),
        }
    }

    /// Stop the timer and the worker pool.
    ///
    /// Each phase waits at most `shutdown_grace`. Threads still running after
    /// that are reported through the diagnostic logger and left detached.
    /// The host's main context is not touched. Calling this again is a no-op.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let name = &self.config.name;
        let grace = self.config.shutdown_grace;
        tracing::debug!(scheduler = %name, ?grace, "shutting down");

        if !self.timer.stop(grace) {
            let timer_name = self.timer.name();
            report_stuck_threads(&self.registry, self.logger.as_ref(), |thread| {
                thread == timer_name
            });
        }

        if !self.pool.shutdown(grace) {
            self.logger.severe(&format!(
                "Timed out waiting for the {} worker thread pool to terminate",
                name
            ));
            let prefix = self.config.worker_prefix();
            report_stuck_threads(&self.registry, self.logger.as_ref(), |thread| {
                thread.starts_with(&prefix)
            });
        }

        let rearm_failures = self.timer.rearm_failures();
        if rearm_failures > 0 {
            self.logger.severe(&format!(
                "{} repeating task(s) on {} stopped early because they could not be re-armed",
                rearm_failures, name
            ));
        }

        tracing::debug!(
            scheduler = %name,
            detached = self.registry.live_threads(),
            "scheduler shut down"
        );
    }

    fn next_id(&self) -> TaskId {
        TaskId::from_raw(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    fn executor(&self, domain: Domain) -> Arc<dyn Executor> {
        match domain {
            Domain::Sync => Arc::clone(&self.sync),
            Domain::Async => self.pool.clone(),
        }
    }

    fn handle<T>(
        &self,
        id: TaskId,
        domain: Domain,
        mode: Mode,
        completion: Arc<Completion<T>>,
        registration: Option<Arc<Registration>>,
    ) -> TaskHandle<T> {
        TaskHandle::new(
            id,
            domain,
            mode,
            completion,
            registration,
            Arc::clone(&self.main_thread),
            self.config.main_thread_wait,
        )
    }

    fn submit_once<T, F>(&self, domain: Domain, delay: Option<Duration>, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let id = self.next_id();
        let mode = delay.map_or(Mode::Immediate, Mode::Delayed);
        let completion = Arc::new(Completion::new(false));
        let origin = Arc::new(Backtrace::capture());

        if self.is_shut_down() {
            self.reject(&*completion, id, RejectedError::shut_down("scheduler"));
            return self.handle(id, domain, mode, completion, None);
        }

        let job = self.once_job(id, Arc::clone(&completion), Arc::clone(&origin), work);
        let executor = self.executor(domain);

        let (registration, submitted) = match delay {
            None => (None, executor.execute(job)),
            Some(delay) => {
                let hook: Arc<dyn Terminate> = completion.clone();
                let registration = Arc::new(Registration::new(id, origin, hook));
                let armed = self
                    .timer
                    .schedule_once(executor, job, delay, Arc::clone(&registration));
                (Some(registration), armed)
            }
        };

        match submitted {
            Ok(()) => {
                Counters::bump(&self.counters.submitted);
                tracing::trace!(task = %id, %domain, ?mode, "task submitted");
            }
            Err(err) => self.reject(&*completion, id, err),
        }
        self.handle(id, domain, mode, completion, registration)
    }

    fn submit_repeating<F>(&self, domain: Domain, interval: Duration, work: F) -> TaskHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id();
        let mode = Mode::Repeating(interval);
        let completion = Arc::new(Completion::new(true));
        let origin = Arc::new(Backtrace::capture());

        if self.is_shut_down() {
            self.reject(&*completion, id, RejectedError::shut_down("scheduler"));
            return self.handle(id, domain, mode, completion, None);
        }
        if interval.is_zero() {
            completion.settle(Err(SchedulerError::Unsupported(
                "repeating task with a zero interval",
            )));
            return self.handle(id, domain, mode, completion, None);
        }

        let hook: Arc<dyn Terminate> = completion.clone();
        let registration = Arc::new(Registration::new(id, Arc::clone(&origin), hook));
        let make_job = self.repeating_job_factory(id, Arc::clone(&completion), origin, work);

        let armed = self.timer.schedule_repeating(
            self.executor(domain),
            make_job,
            interval,
            Arc::clone(&registration),
        );
        match armed {
            Ok(()) => {
                Counters::bump(&self.counters.submitted);
                tracing::trace!(task = %id, %domain, ?interval, "repeating task armed");
            }
            Err(err) => self.reject(&*completion, id, err),
        }
        self.handle(id, domain, mode, completion, Some(registration))
    }

    fn reject<T>(&self, completion: &Completion<T>, id: TaskId, err: RejectedError) {
        Counters::bump(&self.counters.rejected);
        tracing::debug!(scheduler = %self.config.name, task = %id, %err, "submission rejected");
        completion.settle(Err(SchedulerError::Rejected(err)));
    }

    /// Wrap a one-shot body so it settles `completion` with its outcome
    fn once_job<T, F>(
        &self,
        id: TaskId,
        completion: Arc<Completion<T>>,
        origin: Arc<Backtrace>,
        work: F,
    ) -> Job
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let counters = Arc::clone(&self.counters);

        Box::new(move || {
            // Cancelled while queued
            if completion.is_settled() {
                return;
            }

            let _activity = registry.enter(Some(id), origin);
            match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(value) => {
                    Counters::bump(&counters.completed);
                    completion.settle(Ok(value));
                }
                Err(payload) => {
                    Counters::bump(&counters.failed);
                    let failure = TaskFailure::from_panic(payload.as_ref());
                    tracing::debug!(task = %id, error = %failure, "task panicked");
                    completion.settle(Err(SchedulerError::ExecutionFailed(failure)));
                }
            }
        })
    }

    /// Build a job per firing; a panicking firing is logged and the schedule
    /// goes on
    fn repeating_job_factory<F>(
        &self,
        id: TaskId,
        completion: Arc<Completion<()>>,
        origin: Arc<Backtrace>,
        work: F,
    ) -> JobFactory
    where
        F: Fn() + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let registry = Arc::clone(&self.registry);
        let counters = Arc::clone(&self.counters);
        let logger = Arc::clone(&self.logger);

        Arc::new(move || -> Job {
            let work = Arc::clone(&work);
            let completion = Arc::clone(&completion);
            let origin = Arc::clone(&origin);
            let registry = Arc::clone(&registry);
            let counters = Arc::clone(&counters);
            let logger = Arc::clone(&logger);

            Box::new(move || {
                if completion.is_settled() {
                    return;
                }

                let _activity = registry.enter(Some(id), origin);
                match panic::catch_unwind(AssertUnwindSafe(|| work())) {
                    Ok(()) => Counters::bump(&counters.completed),
                    Err(payload) => {
                        Counters::bump(&counters.failed);
                        logger.warn(&format!(
                            "Repeating task {} panicked on thread {}: {}",
                            id,
                            thread::current().name().unwrap_or("<unnamed>"),
                            panic_message(payload.as_ref())
                        ));
                    }
                }
            })
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
