//! readygate-health — probing, retry scheduling, and coordination.
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!   ├── one task per CheckSpec
//!   │   └── RetryScheduler (interval / backoff / attempt budget / deadline)
//!   │       └── Prober::attempt() → AttemptResult
//!   │           ├── http_probe()    GET, status in [200, 400)
//!   │           ├── tcp_probe()     connect
//!   │           └── command_probe() exit status 0
//!   ├── mpsc channel: attempts, then one outcome per check → ProgressSink
//!   └── overall deadline / shutdown → watch cancel → TimedOut
//! ```
//!
//! The coordinator returns an [`OverallResult`](readygate_core::OverallResult)
//! which [`report::render`] turns into human or JSON output.

pub mod checker;
pub mod coordinator;
pub mod report;
pub mod scheduler;

pub use checker::{KindProber, ProbeError, Prober};
pub use coordinator::Coordinator;
pub use report::{format_attempt, render, NullSink, OutputFormat, ProgressSink};
pub use scheduler::RetryScheduler;
