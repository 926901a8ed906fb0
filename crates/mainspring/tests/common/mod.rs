//! Shared helpers for the integration tests

#![allow(dead_code)]

use mainspring::{DiagnosticLogger, MainLoop, Scheduler, SchedulerConfig};
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Print scheduler debug events when `RUST_LOG` asks for them
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Log level of a recorded diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Warn,
    Severe,
}

/// Diagnostic logger that keeps every line for assertions
#[derive(Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().clone()
    }

    pub fn at(&self, level: Level) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.at(level).iter().any(|line| line.contains(needle))
    }
}

impl DiagnosticLogger for RecordingLogger {
    fn warn(&self, message: &str) {
        self.lines.lock().push((Level::Warn, message.to_string()));
    }

    fn severe(&self, message: &str) {
        self.lines.lock().push((Level::Severe, message.to_string()));
    }
}

/// Scheduler whose main context is a [`MainLoop`] owned by the calling thread
pub fn scheduler_with(config: SchedulerConfig) -> (Scheduler, Arc<MainLoop>, Arc<RecordingLogger>) {
    init_tracing();
    let host = Arc::new(MainLoop::new());
    let logger = RecordingLogger::new();
    let scheduler = Scheduler::builder(host.clone(), host.clone())
        .config(config)
        .logger(logger.clone())
        .build()
        .unwrap();
    (scheduler, host, logger)
}

/// Default test scheduler: two workers and a short shutdown grace
pub fn scheduler(name: &str) -> (Scheduler, Arc<MainLoop>, Arc<RecordingLogger>) {
    scheduler_with(
        SchedulerConfig::new(name)
            .with_parallelism(2)
            .with_shutdown_grace(Duration::from_secs(2)),
    )
}
