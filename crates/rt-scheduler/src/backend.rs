//! Scheduling Backends

use std::sync::Arc;

use tracing::{info, warn};

use crate::{BackendKind, ElevatedPriorityBackend, RtConfig, SchedulerError};

/// Work handed to a backend to run on the periodic thread
pub type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// Platform services the periodic loop needs
///
/// `now_ns` and `sleep_until_ns` share one monotonic time base.
pub trait RtBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pin all current and future pages in RAM
    fn lock_memory(&self) -> Result<(), SchedulerError>;

    fn unlock_memory(&self);

    /// Start a thread configured from `config` and run `body` on it
    ///
    /// Returns only after the thread's scheduling setup succeeded or failed.
    fn spawn(&self, config: &RtConfig, body: TaskBody) -> Result<RtThread, SchedulerError>;

    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Block until the monotonic clock reaches `deadline_ns`
    fn sleep_until_ns(&self, deadline_ns: u64);
}

/// Handle to a thread started by a backend
pub struct RtThread {
    handle: ThreadHandle,
}

enum ThreadHandle {
    #[cfg(target_os = "linux")]
    Posix(libc::pthread_t),
    Std(std::thread::JoinHandle<()>),
}

impl RtThread {
    #[cfg(target_os = "linux")]
    pub(crate) fn posix(thread: libc::pthread_t) -> Self {
        Self {
            handle: ThreadHandle::Posix(thread),
        }
    }

    pub(crate) fn std(handle: std::thread::JoinHandle<()>) -> Self {
        Self {
            handle: ThreadHandle::Std(handle),
        }
    }

    /// Wait for the thread to finish
    pub fn join(self) -> Result<(), SchedulerError> {
        match self.handle {
            #[cfg(target_os = "linux")]
            ThreadHandle::Posix(thread) => {
                // SAFETY: thread came from a successful pthread_create and is
                // joined exactly once since `self` is consumed
                let rc = unsafe { libc::pthread_join(thread, std::ptr::null_mut()) };
                if rc != 0 {
                    return Err(SchedulerError::ThreadPanicked);
                }
                Ok(())
            }
            ThreadHandle::Std(handle) => handle.join().map_err(|_| SchedulerError::ThreadPanicked),
        }
    }
}

/// Resolve a backend kind to an implementation
pub fn select_backend(kind: BackendKind) -> Result<Arc<dyn RtBackend>, SchedulerError> {
    match kind {
        BackendKind::Elevated => Ok(Arc::new(ElevatedPriorityBackend::new())),
        #[cfg(target_os = "linux")]
        BackendKind::Posix => Ok(Arc::new(crate::PosixRtBackend)),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Posix => Err(SchedulerError::Unsupported("posix")),
        BackendKind::Auto => Ok(auto_backend()),
    }
}

#[cfg(target_os = "linux")]
fn auto_backend() -> Arc<dyn RtBackend> {
    if crate::posix::can_use_rt_scheduling() {
        info!("Using POSIX real-time backend");
        Arc::new(crate::PosixRtBackend)
    } else {
        warn!("No real-time scheduling privileges, falling back to elevated priority");
        Arc::new(ElevatedPriorityBackend::new())
    }
}

#[cfg(not(target_os = "linux"))]
fn auto_backend() -> Arc<dyn RtBackend> {
    info!("Using elevated priority backend");
    Arc::new(ElevatedPriorityBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_elevated() {
        let backend = select_backend(BackendKind::Elevated).unwrap();
        assert_eq!(backend.name(), "elevated");
    }

    #[test]
    fn test_auto_resolves() {
        let backend = select_backend(BackendKind::Auto).unwrap();
        assert!(["posix", "elevated"].contains(&backend.name()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_explicit_posix() {
        assert_eq!(select_backend(BackendKind::Posix).unwrap().name(), "posix");
    }
}
