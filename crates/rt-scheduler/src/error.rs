//! Scheduler Error Types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `start` called while not idle
    #[error("Periodic task already running")]
    AlreadyRunning,

    /// Configuration rejected before anything was changed
    #[error("Invalid real-time configuration: {0}")]
    InvalidConfig(String),

    /// `mlockall` failed (usually missing CAP_IPC_LOCK)
    #[error("Failed to lock memory: {0}")]
    MemoryLock(std::io::Error),

    /// Thread creation failed (EPERM without real-time privileges)
    #[error("Failed to spawn real-time thread: {0}")]
    Spawn(std::io::Error),

    /// Affinity or scheduling class could not be applied inside the thread
    #[error("Real-time thread setup failed: {0}")]
    ThreadSetup(String),

    /// Requested backend does not exist on this platform
    #[error("Backend {0} is not available on this platform")]
    Unsupported(&'static str),

    /// The real-time thread panicked or could not be joined
    #[error("Real-time thread terminated abnormally")]
    ThreadPanicked,
}
