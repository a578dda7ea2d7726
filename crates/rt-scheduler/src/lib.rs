//! Real-Time Periodic Scheduler
//!
//! Runs one callback on a dedicated thread at a fixed period, waiting on
//! absolute deadlines so that jitter does not accumulate. Every cycle's
//! deviation from its deadline is recorded for cyclictest-style latency
//! reporting.
//!
//! Two backends exist: POSIX real-time scheduling on Linux
//! (`SCHED_FIFO`/`SCHED_RR`/`SCHED_DEADLINE`, `mlockall`,
//! `clock_nanosleep`) and a portable elevated-priority thread.

mod backend;
mod config;
mod elevated;
mod error;
mod latency;
#[cfg(target_os = "linux")]
mod posix;
mod task;

pub use backend::{select_backend, RtBackend, RtThread, TaskBody};
pub use config::{BackendKind, RtConfig, SchedPolicy};
pub use elevated::ElevatedPriorityBackend;
pub use error::SchedulerError;
pub use latency::{LatencyStats, LatencySummary};
#[cfg(target_os = "linux")]
pub use posix::PosixRtBackend;
pub use task::{has_rt_preempt, max_rt_priority, PeriodicTask, SchedulerState};
