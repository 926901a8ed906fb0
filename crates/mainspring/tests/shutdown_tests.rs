//! Integration tests for bounded shutdown and its diagnostics

mod common;

use common::{init_tracing, scheduler, scheduler_with, Level, RecordingLogger};
use crossbeam::channel;
use mainspring::{
    Executor, Job, MainLoop, RejectedError, Scheduler, SchedulerConfig, SchedulerError, TaskState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_shutdown_with_stuck_worker_returns_and_reports_it() {
    let (scheduler, _host, logger) = scheduler_with(
        SchedulerConfig::new("stuck")
            .with_parallelism(1)
            .with_shutdown_grace(Duration::from_millis(200)),
    );
    let (release_tx, release_rx) = channel::bounded::<()>(0);

    let handle = scheduler.execute_async(move || {
        let _ = release_rx.recv_timeout(Duration::from_secs(5));
    });
    thread::sleep(Duration::from_millis(30));

    let start = Instant::now();
    scheduler.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));

    assert!(logger.contains(
        Level::Severe,
        "Timed out waiting for the stuck worker thread pool to terminate"
    ));
    let warnings = logger.at(Level::Warn);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("Thread stuck-0 is blocked"));
    assert!(warnings[0].contains(&format!("running task {}", handle.id())));

    drop(release_tx);
}

#[test]
fn test_clean_shutdown_logs_nothing() {
    let (scheduler, _host, logger) = scheduler("clean");

    let handle = scheduler.execute_async(|| 1);
    let _ = thread::spawn(move || handle.wait()).join();
    scheduler.shutdown();

    assert!(logger.lines().is_empty());
}

#[test]
fn test_shutdown_drains_queued_async_work() {
    let (scheduler, _host, _) = scheduler_with(
        SchedulerConfig::new("drain")
            .with_parallelism(1)
            .with_shutdown_grace(Duration::from_secs(2)),
    );
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let done = done.clone();
            scheduler.execute_async(move || {
                thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    scheduler.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert!(handles.iter().all(|h| h.state() == TaskState::Completed));
}

#[test]
fn test_shutdown_leaves_main_loop_queue_alone() {
    let (scheduler, host, _) = scheduler("host-queue");
    let handle = scheduler.execute_sync(|| 5);

    scheduler.shutdown();
    assert_eq!(host.pending(), 1);
    assert_eq!(host.run_pending(), 1);
    assert_eq!(handle.wait(), Ok(5));
}

#[test]
fn test_drop_cancels_armed_tasks() {
    let (scheduler, _host, _) = scheduler("dropped");
    let delayed = scheduler.async_later(|| 1, Duration::from_secs(60));
    let repeating = scheduler.async_repeating(|| {}, Duration::from_secs(60));

    drop(scheduler);

    assert_eq!(delayed.state(), TaskState::Cancelled);
    assert_eq!(repeating.state(), TaskState::Cancelled);
}

#[test]
fn test_host_rejecting_firing_is_a_rearm_failure() {
    let (scheduler, host, logger) = scheduler("rearm");
    host.close();

    let handle = scheduler.sync_repeating(|| {}, Duration::from_millis(10));
    thread::sleep(Duration::from_millis(80));

    assert_eq!(handle.state(), TaskState::Failed);
    assert!(matches!(handle.wait(), Err(SchedulerError::ReArmFailure(_))));
    assert_eq!(scheduler.stats().rearm_failures, 1);
    assert_eq!(scheduler.stats().armed_timers, 0);

    let severe = logger.at(Level::Severe);
    assert_eq!(severe.len(), 1);
    assert!(severe[0].contains(&handle.id().to_string()));

    // Reported again when the scheduler goes down
    scheduler.shutdown();
    let severe = logger.at(Level::Severe);
    assert_eq!(severe.len(), 2);
    assert!(severe[1].contains("could not be re-armed"));
}

/// Sync executor whose `execute` blocks until released
struct BlockingExecutor {
    release: channel::Receiver<()>,
}

impl Executor for BlockingExecutor {
    fn execute(&self, _job: Job) -> Result<(), RejectedError> {
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        Err(RejectedError::new("host went away"))
    }
}

#[test]
fn test_shutdown_reports_stuck_timer_thread() {
    init_tracing();
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let logger = RecordingLogger::new();
    let main = Arc::new(MainLoop::new());

    let scheduler = Scheduler::builder(
        Arc::new(BlockingExecutor {
            release: release_rx,
        }),
        main,
    )
    .config(
        SchedulerConfig::new("frozen-host")
            .with_parallelism(1)
            .with_shutdown_grace(Duration::from_millis(150)),
    )
    .logger(logger.clone())
    .build()
    .unwrap();

    let handle = scheduler.sync_later(|| (), Duration::from_millis(10));
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    scheduler.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));

    let warnings = logger.at(Level::Warn);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("Thread frozen-host is blocked"));
    assert!(warnings[0].contains(&handle.id().to_string()));
    // Worker threads stopped in time
    assert!(logger.at(Level::Severe).is_empty());

    drop(release_tx);
}

/// Sync executor that panics instead of accepting work
struct PanickingExecutor;

impl Executor for PanickingExecutor {
    fn execute(&self, _job: Job) -> Result<(), RejectedError> {
        panic!("host executor is broken");
    }
}

#[test]
fn test_panicking_host_executor_keeps_timer_alive() {
    init_tracing();
    let logger = RecordingLogger::new();
    let main = Arc::new(MainLoop::new());

    let scheduler = Scheduler::builder(Arc::new(PanickingExecutor), main)
        .config(
            SchedulerConfig::new("broken-host")
                .with_parallelism(1)
                .with_shutdown_grace(Duration::from_secs(2)),
        )
        .logger(logger.clone())
        .build()
        .unwrap();

    let repeating = scheduler.sync_repeating(|| {}, Duration::from_millis(10));
    thread::sleep(Duration::from_millis(60));

    assert_eq!(repeating.state(), TaskState::Failed);
    match repeating.wait() {
        Err(SchedulerError::ReArmFailure(reason)) => {
            assert!(reason.contains("host executor is broken"))
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(logger.contains(Level::Severe, &repeating.id().to_string()));

    // The timer thread still serves later submissions
    let later = scheduler.async_later(|| 42, Duration::from_millis(10));
    let result = thread::spawn(move || later.wait_timeout(Duration::from_secs(2)))
        .join()
        .unwrap();
    assert_eq!(result, Ok(42));

    let delayed = scheduler.sync_later(|| 1, Duration::from_millis(10));
    assert!(matches!(
        thread::spawn(move || delayed.wait_timeout(Duration::from_secs(2)))
            .join()
            .unwrap(),
        Err(SchedulerError::Rejected(_))
    ));
    assert_eq!(scheduler.stats().rearm_failures, 1);
    assert_eq!(scheduler.stats().rejected, 1);

    scheduler.shutdown();
}

#[test]
fn test_unbounded_grace_shutdown_and_drop() {
    let (scheduler, _host, logger) = scheduler_with(
        SchedulerConfig::new("patient")
            .with_parallelism(1)
            .with_shutdown_grace(Duration::MAX),
    );
    let done = Arc::new(AtomicUsize::new(0));
    let flag = done.clone();

    let handle = scheduler.execute_async(move || {
        thread::sleep(Duration::from_millis(50));
        flag.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.shutdown();

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), TaskState::Completed);
    assert!(logger.lines().is_empty());

    let (dropped, _host, _) = scheduler_with(
        SchedulerConfig::new("patient-drop").with_shutdown_grace(Duration::MAX),
    );
    let pending = dropped.async_later(|| 1, Duration::from_secs(60));
    drop(dropped);
    assert_eq!(pending.state(), TaskState::Cancelled);
}
