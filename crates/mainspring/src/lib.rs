//! Mainspring
//!
//! Task scheduling for applications embedded in a host that owns a main
//! thread:
//! - **sync domain**: work runs on the host's main context through a host
//!   supplied [`Executor`]
//! - **async domain**: work runs on a fixed worker pool owned by the scheduler
//! - **timing**: immediate, delayed and fixed-rate repeating submission via a
//!   single timer thread
//! - **handles**: [`TaskHandle::wait`] refuses to block the main thread for
//!   longer than a configured bound, cancellation never interrupts running work
//! - **shutdown**: bounded, reporting any thread that does not stop in time
//!
//! # Example
//!
//! ```rust,ignore
//! use mainspring::{MainLoop, Scheduler, SchedulerConfig};
//! use std::sync::Arc;
//!
//! let host = Arc::new(MainLoop::new());
//! let scheduler = Scheduler::builder(host.clone(), host.clone())
//!     .config(SchedulerConfig::new("plugin"))
//!     .build()?;
//!
//! let answer = scheduler.execute_async(|| 6 * 7);
//! let greeting = scheduler.execute_sync(|| "hello from the main thread");
//! host.run_pending();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod handle;
pub mod host;
pub mod scheduler;

mod pool;
mod timer;

pub use config::{SchedulerConfig, DEFAULT_MAIN_THREAD_WAIT, DEFAULT_SHUTDOWN_GRACE};
pub use diagnostics::{DiagnosticLogger, ThreadReport, TracingLogger};
pub use error::{BuildError, ConfigError, RejectedError, SchedulerError, SchedulerResult, TaskFailure};
pub use executor::{Domain, Executor, Job, MainThreadCheck, MainThreadId, Mode};
pub use handle::{TaskHandle, TaskId, TaskState};
pub use host::MainLoop;
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStats};
