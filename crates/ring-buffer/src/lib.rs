//! Shared-Memory Ring Buffer
//!
//! Single-producer single-consumer byte ring for variable-length messages.
//! The ring lives either in a POSIX shared memory segment (producer and
//! consumer in different processes) or on the heap (different threads of
//! one process). Both use the same layout:
//!
//! ```text
//! [ControlBlock][data region: capacity bytes]
//! ```
//!
//! Every message is stored as a little-endian `u32` length followed by its
//! payload. Neither side ever blocks; a full ring is reported to the writer.

mod buffer;
mod control;
#[cfg(unix)]
mod segment;

pub use buffer::{RingConsumer, RingProducer, SharedRingBuffer};
pub use control::{ControlBlock, CONTROL_BLOCK_SIZE};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest usable data region
pub const MIN_CAPACITY: usize = 8;

/// Size of the length prefix in front of every message
pub const LENGTH_PREFIX: usize = 4;

/// Ring buffer errors
#[derive(Debug, Error)]
pub enum RingError {
    /// Not enough free space; nothing was written
    #[error("Ring full: need {needed} bytes, {available} available")]
    Full { needed: usize, available: usize },

    /// Message longer than half the ring
    #[error("Message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge { len: usize, max: usize },

    /// No message available
    #[error("Ring empty")]
    Empty,

    /// Caller buffer cannot hold the next message; nothing was consumed
    #[error("Read buffer too small: need {needed} bytes")]
    BufferTooSmall { needed: usize },

    /// Length prefix does not fit in the unread bytes
    #[error("Corrupt length prefix {len} with {available} bytes unread")]
    Corrupted { len: usize, available: usize },

    /// Data region size is unusable
    #[error("Invalid ring capacity {0} (minimum {MIN_CAPACITY})")]
    InvalidCapacity(usize),

    /// Attached segment was created with another capacity
    #[error("Capacity mismatch: requested {requested}, segment has {found}")]
    CapacityMismatch { requested: usize, found: usize },

    /// Attached segment has not been initialised by its creator yet
    #[error("Shared memory segment {0} is not initialised")]
    NotInitialized(String),

    /// Segment name breaks POSIX naming rules
    #[error("Invalid segment name: {0}")]
    InvalidName(String),

    /// Operating system error on the shared memory segment
    #[error("Shared memory error: {0}")]
    Segment(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RingError>;

/// Ring location and size
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Shared memory segment name (leading `/`)
    pub name: String,
    /// Data region size in bytes
    pub capacity: usize,
    /// Keep the ring inside this process instead of shared memory
    pub in_process: bool,
    /// Remove the segment name when the bridge shuts down
    pub unlink_on_exit: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            name: "/rt_bridge_ring".to_string(),
            capacity: 1024 * 1024,
            in_process: false,
            unlink_on_exit: true,
        }
    }
}
