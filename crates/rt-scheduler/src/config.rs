//! Real-Time Configuration

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Lowest and highest priority accepted for FIFO and round-robin
pub(crate) const RT_PRIORITY_RANGE: (i32, i32) = (1, 99);

/// Number of CPUs a `cpu_set_t` can name
#[cfg(target_os = "linux")]
pub(crate) const MAX_CPUS: usize = libc::CPU_SETSIZE as usize;
#[cfg(not(target_os = "linux"))]
pub(crate) const MAX_CPUS: usize = 1024;

/// Longest accepted period (one hour)
pub(crate) const MAX_PERIOD_US: u64 = 3_600_000_000;

/// Scheduling class of the periodic thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    /// First-in first-out at a fixed priority
    #[default]
    Fifo,
    /// Round-robin at a fixed priority
    RoundRobin,
    /// Earliest deadline first, reserved from the period
    Deadline,
}

/// Which backend runs the periodic thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// POSIX real-time when the process may use it, elevated priority otherwise
    #[default]
    Auto,
    Posix,
    Elevated,
}

/// Periodic thread configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtConfig {
    /// Scheduling class of the periodic thread
    pub policy: SchedPolicy,
    /// 1-99 for FIFO/RR, 99 is highest
    pub priority: i32,
    /// Pin the thread to this CPU
    pub cpu_affinity: Option<usize>,
    /// `mlockall` before starting to avoid page faults
    pub lock_memory: bool,
    /// Stack size of the periodic thread in KiB
    pub stack_size_kb: usize,
    /// Cycle period in microseconds, at most one hour
    pub period_us: u64,
    /// Deviations above this count as deadline misses (µs)
    pub max_deviation_us: u64,
    /// Backend selection, see [`BackendKind`]
    pub backend: BackendKind,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::Fifo,
            priority: 99,
            cpu_affinity: None,
            lock_memory: true,
            stack_size_kb: 8192,
            period_us: 100,
            max_deviation_us: 1000,
            backend: BackendKind::Auto,
        }
    }
}

impl RtConfig {
    pub fn period_ns(&self) -> u64 {
        self.period_us.saturating_mul(1_000)
    }

    pub fn max_deviation_ns(&self) -> u64 {
        self.max_deviation_us.saturating_mul(1_000)
    }

    pub fn stack_size_bytes(&self) -> usize {
        self.stack_size_kb.saturating_mul(1024)
    }

    /// Reject configurations no backend can honour
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.period_us == 0 {
            return Err(SchedulerError::InvalidConfig(
                "period must be positive".to_string(),
            ));
        }
        if self.period_us > MAX_PERIOD_US {
            return Err(SchedulerError::InvalidConfig(format!(
                "period {}µs exceeds {MAX_PERIOD_US}µs",
                self.period_us
            )));
        }
        if self.stack_size_kb == 0 {
            return Err(SchedulerError::InvalidConfig(
                "stack size must be positive".to_string(),
            ));
        }

        let (min, max) = RT_PRIORITY_RANGE;
        if matches!(self.policy, SchedPolicy::Fifo | SchedPolicy::RoundRobin)
            && !(min..=max).contains(&self.priority)
        {
            return Err(SchedulerError::InvalidConfig(format!(
                "priority {} outside {min}..={max}",
                self.priority
            )));
        }

        if let Some(cpu) = self.cpu_affinity {
            if cpu >= MAX_CPUS {
                return Err(SchedulerError::InvalidConfig(format!(
                    "cpu_affinity {cpu} outside 0..{MAX_CPUS}"
                )));
            }
        }

        Ok(())
    }
}
