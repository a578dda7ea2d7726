//! Ring Control Block

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Encoded size of [`ControlBlock`]; the data region starts right after it
pub const CONTROL_BLOCK_SIZE: usize = std::mem::size_of::<ControlBlock>();

/// Cursor and ownership state at the start of every ring
///
/// Cursors grow without bound and are reduced modulo the capacity when
/// addressing the data region, so `write_pos - read_pos` is always the
/// number of unread bytes. Each cursor sits on its own cache line.
#[repr(C, align(64))]
pub struct ControlBlock {
    /// Total bytes ever written (only the producer stores)
    pub write_pos: AtomicU64,
    _pad_write: [u8; 56],
    /// Total bytes ever consumed (only the consumer stores)
    pub read_pos: AtomicU64,
    _pad_read: [u8; 56],
    /// Data region size; zero until the creator finished initialising
    pub capacity: AtomicU64,
    pub writer_pid: AtomicU32,
    pub reader_pid: AtomicU32,
}

impl ControlBlock {
    /// Reset cursors and publish the capacity
    ///
    /// The capacity store is the last write, so an attacher that observes a
    /// non-zero capacity also observes zeroed cursors.
    pub(crate) fn initialize(&self, capacity: u64) {
        self.write_pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Relaxed);
        self.writer_pid.store(0, Ordering::Relaxed);
        self.reader_pid.store(0, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Release);
    }

    pub(crate) fn published_capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }
}
