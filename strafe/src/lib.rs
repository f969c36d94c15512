//! Strafe: a scriptable load-testing engine.
//!
//! A load test is a Lua script exposing a global `run(iteration)` function. The
//! engine compiles the script once, spins up one interpreter per concurrency
//! slot and calls `run` on every one of them in a tight loop until a stop
//! condition fires. Scripts talk to the outside world through capability
//! modules (filesystem, HTTP, TCP/UDP, WebSocket, gRPC, codecs) that look
//! synchronous from the script's side but run on a small per-VM async worker
//! pool.
//!
//! # Architecture
//!
//! - [`Job`]: owns the runtime, the VMs and the shared [`Global`] state, and
//!   drives iterations until a [`StopCondition`] fires.
//! - [`Vm`]: one interpreter plus its private [`AsyncPool`] and
//!   [`ReleasePool`]. Reset between iterations so that no task or open handle
//!   survives into the next one.
//! - [`Context`]: the per-VM scope stack that labels logs and statistics.
//! - [`Metric`] and [`Stat`]: long-lived aggregates and one-off measurements,
//!   both flowing into a [`Reporter`].
//! - [`bindings`]: the modules a script can `require`.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use strafe::{
//!     fs::{Filesystem, MemoryFs},
//!     report::ConsoleReporter,
//!     Job, JobConfig, StopCondition,
//! };
//!
//! let fs = MemoryFs::new();
//! fs.write("/main.lua", br#"
//!     function run(i)
//!         group("step", function()
//!             local wait = sleep(10)
//!             wait()
//!         end)
//!     end
//! "#).unwrap();
//!
//! let mut job = Job::new(
//!     JobConfig::builder().concurrency(8).build(),
//!     Arc::new(fs),
//!     "/main.lua",
//!     Arc::new(ConsoleReporter::default()),
//! )
//! .unwrap();
//! job.run(StopCondition::duration(Duration::from_secs(5))).unwrap();
//! job.finish().unwrap();
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: console, memory and no-op reporters. (Enabled by default)

/// Bindings exposed to scripts
pub mod bindings;
/// Per-VM scope stack and job-wide shared state
pub mod context;
pub mod error;
/// Virtual filesystems handed to scripts
pub mod fs;
/// VM orchestration
pub mod job;
/// Metric aggregators
pub mod metric;
/// Async task and resource guard pools
pub mod pool;
/// Summaries and Reporters
pub mod report;
pub mod stat;
/// Interpreter instances
pub mod vm;

pub use context::{Context, Global};
pub use error::{Error, Result};
pub use job::{Job, JobConfig, JobState, JobStats, Signal, StopCondition};
pub use metric::Metric;
pub use pool::{AsyncPool, ReleasePool};
pub use report::Reporter;
pub use stat::Stat;
pub use vm::{Prototype, Vm, VmParams};

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use strafe_macros::*;
}
