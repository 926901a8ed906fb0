//! Diagnostic logging and stuck-thread reports
//!
//! Every thread the scheduler owns registers itself here for its lifetime and
//! records which task it is currently running. Rust cannot sample the stack of
//! another thread, so each task carries the backtrace captured where it was
//! submitted (`Backtrace::capture`, enabled through `RUST_BACKTRACE` or
//! `RUST_LIB_BACKTRACE`). When shutdown stalls, the registry turns that into a
//! report of thread name, task, time spent and submission frames.

use crate::handle::TaskId;
use dashmap::DashMap;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Sink for scheduler diagnostics
pub trait DiagnosticLogger: Send + Sync {
    /// Something is wrong but the scheduler keeps going
    fn warn(&self, message: &str);

    /// A component failed to do its job
    fn severe(&self, message: &str);
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Clone)]
pub struct TracingLogger {
    scheduler: String,
}

impl TracingLogger {
    /// Create a logger tagging every event with the scheduler name
    pub fn new(scheduler: impl Into<String>) -> Self {
        Self {
            scheduler: scheduler.into(),
        }
    }
}

impl DiagnosticLogger for TracingLogger {
    fn warn(&self, message: &str) {
        tracing::warn!(scheduler = %self.scheduler, "{}", message);
    }

    fn severe(&self, message: &str) {
        tracing::error!(scheduler = %self.scheduler, "{}", message);
    }
}

/// What a registered thread is doing right now
#[derive(Clone)]
struct Activity {
    task: Option<TaskId>,
    since: Instant,
    origin: Arc<Backtrace>,
}

struct ThreadEntry {
    name: String,
    activity: Option<Activity>,
}

/// Live scheduler-owned threads and their current activity
#[derive(Default)]
pub(crate) struct ThreadRegistry {
    threads: DashMap<ThreadId, ThreadEntry>,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread until the returned guard is dropped
    pub(crate) fn register_current(self: &Arc<Self>) -> RegisteredThread {
        let current = thread::current();
        let name = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));

        self.threads.insert(
            current.id(),
            ThreadEntry {
                name,
                activity: None,
            },
        );

        RegisteredThread {
            registry: Arc::clone(self),
            thread: current.id(),
        }
    }

    /// Record that the calling thread started running `task`.
    ///
    /// Threads that never registered (the host's main thread) are ignored.
    pub(crate) fn enter(&self, task: Option<TaskId>, origin: Arc<Backtrace>) -> ActivityScope<'_> {
        let thread = thread::current().id();
        if let Some(mut entry) = self.threads.get_mut(&thread) {
            entry.activity = Some(Activity {
                task,
                since: Instant::now(),
                origin,
            });
        }
        ActivityScope {
            registry: self,
            thread,
        }
    }

    /// Number of registered threads still alive
    pub(crate) fn live_threads(&self) -> usize {
        self.threads.len()
    }

    /// Reports for every live thread whose name matches `predicate`
    pub(crate) fn reports(&self, predicate: impl Fn(&str) -> bool) -> Vec<ThreadReport> {
        let snapshot: Vec<(String, Option<Activity>)> = self
            .threads
            .iter()
            .filter(|entry| predicate(&entry.value().name))
            .map(|entry| (entry.value().name.clone(), entry.value().activity.clone()))
            .collect();

        let mut reports: Vec<ThreadReport> = snapshot
            .into_iter()
            .map(|(thread, activity)| ThreadReport::new(thread, activity))
            .collect();
        reports.sort_by(|a, b| a.thread.cmp(&b.thread));
        reports
    }

    fn leave(&self, thread: ThreadId) {
        if let Some(mut entry) = self.threads.get_mut(&thread) {
            entry.activity = None;
        }
    }
}

/// Keeps a thread registered; removes it on drop
pub(crate) struct RegisteredThread {
    registry: Arc<ThreadRegistry>,
    thread: ThreadId,
}

impl Drop for RegisteredThread {
    fn drop(&mut self) {
        self.registry.threads.remove(&self.thread);
    }
}

/// Clears the thread's activity on drop
pub(crate) struct ActivityScope<'a> {
    registry: &'a ThreadRegistry,
    thread: ThreadId,
}

impl Drop for ActivityScope<'_> {
    fn drop(&mut self) {
        self.registry.leave(self.thread);
    }
}

/// Snapshot of one thread that did not stop in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadReport {
    /// Thread name
    pub thread: String,
    /// Task the thread was running, if any
    pub task: Option<TaskId>,
    /// How long it had been running that task
    pub busy_for: Option<Duration>,
    /// Frames of the backtrace captured where the task was submitted
    pub frames: Vec<String>,
}

impl ThreadReport {
    fn new(thread: String, activity: Option<Activity>) -> Self {
        match activity {
            Some(activity) => Self {
                thread,
                task: activity.task,
                busy_for: Some(activity.since.elapsed()),
                frames: frames_of(&activity.origin),
            },
            None => Self {
                thread,
                task: None,
                busy_for: None,
                frames: Vec::new(),
            },
        }
    }
}

fn frames_of(backtrace: &Backtrace) -> Vec<String> {
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    backtrace
        .to_string()
        .lines()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

impl fmt::Display for ThreadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thread {} is blocked, and may be the reason for the slow shutdown!",
            self.thread
        )?;

        match (self.task, self.busy_for) {
            (Some(task), Some(busy)) => {
                write!(f, "\n  running task {} for {:.1?}", task, busy)?
            }
            (None, Some(busy)) => write!(f, "\n  running an untracked job for {:.1?}", busy)?,
            _ => write!(f, "\n  idle")?,
        }

        if self.busy_for.is_some() {
            if self.frames.is_empty() {
                write!(
                    f,
                    "\n  <submission backtrace not captured; set RUST_BACKTRACE=1 to record it>"
                )?;
            } else {
                write!(f, ", submitted at:")?;
                for frame in &self.frames {
                    write!(f, "\n  {}", frame)?;
                }
            }
        }
        Ok(())
    }
}

/// Log a report for every live thread matching `predicate`; returns how many
pub(crate) fn report_stuck_threads(
    registry: &ThreadRegistry,
    logger: &dyn DiagnosticLogger,
    predicate: impl Fn(&str) -> bool,
) -> usize {
    let reports = registry.reports(predicate);
    for report in &reports {
        logger.warn(&report.to_string());
    }
    reports.len()
}
