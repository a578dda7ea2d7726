//! Elevated Priority Backend
//!
//! Portable fallback: a normal thread with the highest priority the process
//! may request. Absolute deadlines are met by sleeping coarsely and spinning
//! for the remainder.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::backend::{RtBackend, RtThread, TaskBody};
use crate::{RtConfig, SchedulerError};

/// Remaining time below which the wait spins instead of sleeping
const SPIN_THRESHOLD: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy)]
pub struct ElevatedPriorityBackend {
    origin: Instant,
}

impl Default for ElevatedPriorityBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ElevatedPriorityBackend {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

/// Raise the calling thread's priority and pin it, logging what fails
fn elevate_current_thread(cpu_affinity: Option<usize>) {
    #[cfg(unix)]
    {
        // SAFETY: on Linux `who = 0` names the calling thread
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -20) };
        if rc != 0 {
            warn!(
                "Could not raise thread priority: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    if let Some(cpu) = cpu_affinity {
        if let Err(e) = pin_current_thread(cpu) {
            warn!("{}", e);
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) -> Result<(), String> {
    crate::posix::set_current_thread_affinity(cpu)
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(cpu: usize) -> Result<(), String> {
    Err(format!("CPU affinity not supported on this platform (cpu {cpu})"))
}

impl RtBackend for ElevatedPriorityBackend {
    fn name(&self) -> &'static str {
        "elevated"
    }

    #[cfg(unix)]
    fn lock_memory(&self) -> Result<(), SchedulerError> {
        // SAFETY: mlockall has no memory-safety preconditions
        if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
            return Err(SchedulerError::MemoryLock(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_memory(&self) -> Result<(), SchedulerError> {
        debug!("Memory locking not supported on this platform");
        Ok(())
    }

    #[cfg(unix)]
    fn unlock_memory(&self) {
        // SAFETY: as above
        unsafe { libc::munlockall() };
    }

    #[cfg(not(unix))]
    fn unlock_memory(&self) {}

    fn spawn(&self, config: &RtConfig, body: TaskBody) -> Result<RtThread, SchedulerError> {
        let cpu_affinity = config.cpu_affinity;
        let handle = std::thread::Builder::new()
            .name("rt-periodic".to_string())
            .stack_size(config.stack_size_bytes())
            .spawn(move || {
                elevate_current_thread(cpu_affinity);
                body();
            })
            .map_err(SchedulerError::Spawn)?;

        debug!("Started elevated priority thread");
        Ok(RtThread::std(handle))
    }

    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        loop {
            let now = self.now_ns();
            if now >= deadline_ns {
                return;
            }
            let remaining = Duration::from_nanos(deadline_ns - now);
            if remaining > SPIN_THRESHOLD {
                std::thread::sleep(remaining - SPIN_THRESHOLD);
            } else {
                std::hint::spin_loop();
            }
        }
    }
}
