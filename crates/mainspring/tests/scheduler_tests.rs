//! Integration tests for task submission, waiting and cancellation

mod common;

use common::{scheduler, scheduler_with, Level};
use mainspring::{Domain, Mode, SchedulerConfig, SchedulerError, TaskState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_async_result_awaited_off_main_thread() {
    let (scheduler, _host, _) = scheduler("answer");

    let handle = scheduler.execute_async(|| 42);
    assert!(handle.is_async());
    assert_eq!(handle.domain(), Domain::Async);
    assert_eq!(handle.mode(), Mode::Immediate);

    let result = thread::spawn(move || handle.wait()).join().unwrap();
    assert_eq!(result, Ok(42));
}

#[test]
fn test_wait_twice_returns_same_outcome() {
    let (scheduler, _host, _) = scheduler("twice");

    let ok = scheduler.execute_async(|| "value".to_string());
    let failed = scheduler.execute_async(|| -> u8 { panic!("broken task") });

    let results = thread::spawn(move || {
        (ok.wait(), ok.wait(), failed.wait(), failed.wait())
    })
    .join()
    .unwrap();

    assert_eq!(results.0, Ok("value".to_string()));
    assert_eq!(results.0, results.1);
    match &results.2 {
        Err(SchedulerError::ExecutionFailed(failure)) => {
            assert_eq!(failure.message(), "broken task");
            assert!(failure.thread().unwrap_or_default().starts_with("twice-"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(results.2, results.3);
}

#[test]
fn test_off_main_wait_blocks_until_completion() {
    let (scheduler, _host, _) = scheduler("blocking");

    let handle = scheduler.execute_async(|| {
        thread::sleep(Duration::from_millis(150));
        7
    });

    let (value, waited) = thread::spawn(move || {
        let start = Instant::now();
        (handle.wait(), start.elapsed())
    })
    .join()
    .unwrap();

    assert_eq!(value, Ok(7));
    assert!(waited >= Duration::from_millis(100));
}

#[test]
fn test_repeating_task_runs_at_fixed_rate_until_cancelled() {
    let (scheduler, _host, _) = scheduler("ticker");
    let counter = Arc::new(AtomicUsize::new(0));
    let ticks = counter.clone();

    let handle = scheduler.async_repeating(
        move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(10),
    );
    assert!(handle.is_repeatable());
    assert_eq!(handle.state(), TaskState::Active);

    thread::sleep(Duration::from_millis(105));
    assert!(handle.cancel());
    // A firing already on a worker may still finish
    thread::sleep(Duration::from_millis(20));

    let after_cancel = counter.load(Ordering::SeqCst);
    assert!((5..=16).contains(&after_cancel), "ran {} times", after_cancel);

    thread::sleep(Duration::from_millis(60));
    assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(!handle.cancel());
}

#[test]
fn test_sync_wait_on_main_thread_fails_fast() {
    let (scheduler, host, _) = scheduler("main-guard");
    assert!(scheduler.is_main_thread());

    let handle = scheduler.execute_sync(|| 1);
    let start = Instant::now();
    let result = handle.wait();

    assert!(matches!(result, Err(SchedulerError::MainThreadBlocked { .. })));
    assert!(start.elapsed() < Duration::from_secs(1));

    // The task itself is unaffected and completes once the loop is pumped
    assert_eq!(host.run_pending(), 1);
    assert_eq!(handle.wait(), Ok(1));
}

#[test]
fn test_forced_wait_on_sync_task_is_unsupported() {
    let (scheduler, _host, _) = scheduler("forced");
    let handle = scheduler.execute_sync(|| 1);
    assert!(matches!(handle.wait_forced(), Err(SchedulerError::Unsupported(_))));

    let handle = scheduler.execute_async(|| 2);
    assert_eq!(handle.wait_forced(), Ok(2));
}

#[test]
fn test_sync_task_awaited_from_worker() {
    let (scheduler, host, _) = scheduler("cross");
    let handle = scheduler.execute_sync(|| thread::current().name().map(str::to_string));

    let waiter = thread::spawn(move || handle.wait());
    thread::sleep(Duration::from_millis(20));
    host.run_pending();

    let name = waiter.join().unwrap().unwrap();
    assert_eq!(name, thread::current().name().map(str::to_string));
}

#[test]
fn test_cancelled_task_never_completes() {
    let (scheduler, _host, _) = scheduler("cancel");
    let ran = Arc::new(AtomicUsize::new(0));
    let flag = ran.clone();

    let handle = scheduler.async_later(
        move || {
            flag.fetch_add(1, Ordering::SeqCst);
            1
        },
        Duration::from_millis(50),
    );
    assert!(handle.cancel());
    assert!(!handle.cancel());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert_eq!(handle.wait(), Err(SchedulerError::Cancelled));
}

#[test]
fn test_cancel_does_not_interrupt_running_task() {
    let (scheduler, _host, _) = scheduler("running");
    let finished = Arc::new(AtomicUsize::new(0));
    let flag = finished.clone();

    let handle = scheduler.execute_async(move || {
        thread::sleep(Duration::from_millis(80));
        flag.fetch_add(1, Ordering::SeqCst);
    });
    thread::sleep(Duration::from_millis(20));

    assert!(handle.cancel());
    thread::sleep(Duration::from_millis(120));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), TaskState::Cancelled);
}

#[test]
fn test_sync_later_runs_on_main_loop_after_delay() {
    let (scheduler, host, _) = scheduler("sync-later");
    let start = Instant::now();

    let handle = scheduler.sync_later(move || start.elapsed(), Duration::from_millis(40));
    assert_eq!(handle.mode(), Mode::Delayed(Duration::from_millis(40)));

    assert_eq!(host.run_pending(), 0);
    assert_eq!(host.run_for(Duration::from_millis(200)), 1);

    let elapsed = handle.wait().unwrap();
    assert!(elapsed >= Duration::from_millis(40));
}

#[test]
fn test_sync_repeating_fires_through_main_loop() {
    let (scheduler, host, _) = scheduler("sync-tick");
    let counter = Arc::new(AtomicUsize::new(0));
    let ticks = counter.clone();

    let handle = scheduler.sync_repeating(
        move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(10),
    );

    host.run_for(Duration::from_millis(100));
    handle.cancel();
    host.run_pending();

    let ran = counter.load(Ordering::SeqCst);
    assert!((4..=12).contains(&ran), "ran {} times", ran);
}

#[test]
fn test_wait_timeout_expires() {
    let (scheduler, _host, _) = scheduler("timeout");
    let handle = scheduler.execute_async(|| {
        thread::sleep(Duration::from_millis(300));
    });

    let result = thread::spawn(move || handle.wait_timeout(Duration::from_millis(30)))
        .join()
        .unwrap();
    assert!(matches!(result, Err(SchedulerError::Timeout { .. })));
}

#[test]
fn test_submission_after_shutdown_is_rejected() {
    let (scheduler, _host, _) = scheduler("closed");
    scheduler.shutdown();

    let handle = scheduler.execute_async(|| 1);
    assert!(handle.is_done());
    assert_eq!(handle.state(), TaskState::Failed);
    assert!(matches!(handle.wait(), Err(SchedulerError::Rejected(_))));

    let handle = scheduler.sync_repeating(|| {}, Duration::from_millis(10));
    assert!(matches!(handle.wait(), Err(SchedulerError::Rejected(_))));

    assert_eq!(scheduler.stats().rejected, 2);
}

#[test]
fn test_raw_job_panic_is_logged_and_pool_survives() {
    let (scheduler, _host, logger) = scheduler("raw");

    scheduler
        .async_executor()
        .execute(Box::new(|| panic!("fire and forget failed")))
        .unwrap();

    let handle = scheduler.execute_async(|| 3);
    let result = thread::spawn(move || handle.wait()).join().unwrap();
    assert_eq!(result, Ok(3));

    thread::sleep(Duration::from_millis(20));
    assert!(logger.contains(Level::Warn, "fire and forget failed"));
}

#[test]
fn test_unbounded_main_thread_wait_returns_result() {
    let (scheduler, _host, _) = scheduler_with(
        SchedulerConfig::new("no-guard")
            .with_parallelism(1)
            .with_main_thread_wait(Duration::MAX),
    );
    assert!(scheduler.is_main_thread());

    let handle = scheduler.execute_async(|| {
        thread::sleep(Duration::from_millis(60));
        8
    });
    assert_eq!(handle.wait(), Ok(8));
}

#[test]
fn test_delayed_task_refused_at_deadline_counts_as_rejected() {
    let (scheduler, host, _) = scheduler("late-refusal");
    host.close();

    let handle = scheduler.sync_later(|| 1, Duration::from_millis(10));
    let result = thread::spawn(move || handle.wait_timeout(Duration::from_secs(2)))
        .join()
        .unwrap();

    assert!(matches!(result, Err(SchedulerError::Rejected(_))));
    let stats = scheduler.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.rejected, 1);
}
