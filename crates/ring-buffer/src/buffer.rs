//! SPSC Byte Ring
//!
//! The producer publishes message bytes before release-storing the write
//! cursor; the consumer acquire-loads the write cursor before touching the
//! bytes and release-stores the read cursor once they are copied out.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use crate::control::{ControlBlock, CONTROL_BLOCK_SIZE};
#[cfg(unix)]
use crate::segment::{Opened, ShmSegment};
use crate::{Result, RingError, LENGTH_PREFIX, MIN_CAPACITY};

/// Memory backing a ring
enum Region {
    #[cfg(unix)]
    Shared(ShmSegment),
    Heap { ptr: NonNull<u8>, layout: Layout },
}

impl Region {
    fn base(&self) -> *mut u8 {
        match self {
            #[cfg(unix)]
            Region::Shared(segment) => segment.as_ptr(),
            Region::Heap { ptr, .. } => ptr.as_ptr(),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Region::Heap { ptr, layout } = self {
            // SAFETY: allocated in `SharedRingBuffer::in_process` with this layout
            unsafe { alloc::dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

struct RingInner {
    region: Region,
    capacity: usize,
}

// SAFETY: the region is only mutated through the control block atomics and
// the SPSC protocol: the producer writes only unpublished bytes, the
// consumer reads only published ones.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

impl RingInner {
    fn control(&self) -> &ControlBlock {
        // SAFETY: every region starts with an initialised, 64-byte aligned
        // control block (mmap is page aligned, heap layout is 64 aligned)
        unsafe { &*(self.region.base() as *const ControlBlock) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: the region is CONTROL_BLOCK_SIZE + capacity bytes long
        unsafe { self.region.base().add(CONTROL_BLOCK_SIZE) }
    }

    fn offset(&self, pos: u64) -> usize {
        (pos % self.capacity as u64) as usize
    }

    /// Copy `src` into the data region at cursor `pos`, wrapping at the end
    fn copy_in(&self, pos: u64, src: &[u8]) {
        debug_assert!(src.len() <= self.capacity);
        let offset = self.offset(pos);
        let tail = src.len().min(self.capacity - offset);
        // SAFETY: offset + tail <= capacity and src.len() - tail <= offset
        // stay inside the data region; the bytes are not yet published so
        // the consumer cannot be reading them
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(offset), tail);
            ptr::copy_nonoverlapping(src.as_ptr().add(tail), self.data(), src.len() - tail);
        }
    }

    /// Copy from the data region at cursor `pos` into `dst`, wrapping at the end
    fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.capacity);
        let offset = self.offset(pos);
        let tail = dst.len().min(self.capacity - offset);
        // SAFETY: bounds as in copy_in; the bytes are published and the
        // producer will not overwrite them before the read cursor moves
        unsafe {
            ptr::copy_nonoverlapping(self.data().add(offset), dst.as_mut_ptr(), tail);
            ptr::copy_nonoverlapping(self.data(), dst.as_mut_ptr().add(tail), dst.len() - tail);
        }
    }

    fn available_read(&self) -> usize {
        let control = self.control();
        let read = control.read_pos.load(Ordering::Acquire);
        let write = control.write_pos.load(Ordering::Acquire);
        (write.wrapping_sub(read) as usize).min(self.capacity)
    }

    fn available_write(&self) -> usize {
        self.capacity - self.available_read()
    }
}

macro_rules! ring_status {
    () => {
        /// Size of the data region in bytes
        pub fn capacity(&self) -> usize {
            self.inner.capacity
        }

        /// Bytes written and not yet consumed, length prefixes included
        pub fn available_read(&self) -> usize {
            self.inner.available_read()
        }

        /// Free bytes in the data region
        pub fn available_write(&self) -> usize {
            self.inner.available_write()
        }

        pub fn is_empty(&self) -> bool {
            self.inner.available_read() == 0
        }

        /// Pid of the process holding the producer role (0 if none)
        pub fn writer_pid(&self) -> u32 {
            self.inner.control().writer_pid.load(Ordering::Relaxed)
        }

        /// Pid of the process holding the consumer role (0 if none)
        pub fn reader_pid(&self) -> u32 {
            self.inner.control().reader_pid.load(Ordering::Relaxed)
        }
    };
}

/// A ring that has not been assigned a role yet
pub struct SharedRingBuffer {
    inner: Arc<RingInner>,
    created: bool,
}

impl SharedRingBuffer {
    /// Create or attach the shared memory ring `name`
    ///
    /// The first caller creates, sizes and initialises the segment. Later
    /// callers attach and must request the same capacity.
    #[cfg(unix)]
    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;
        let size = CONTROL_BLOCK_SIZE + capacity;

        let (segment, created) = match ShmSegment::create_or_open(name, size)? {
            Opened::Created(segment) => {
                // SAFETY: fresh zeroed mapping of `size` bytes
                let control = unsafe { &*(segment.as_ptr() as *const ControlBlock) };
                control.initialize(capacity as u64);
                info!("Created ring {} with {} byte data region", name, capacity);
                (segment, true)
            }
            Opened::Attached(segment) => {
                if segment.size() < CONTROL_BLOCK_SIZE {
                    return Err(RingError::NotInitialized(name.to_string()));
                }
                // SAFETY: the mapping holds at least a control block
                let control = unsafe { &*(segment.as_ptr() as *const ControlBlock) };
                let found = control.published_capacity() as usize;
                if found == 0 || segment.size() < CONTROL_BLOCK_SIZE + found {
                    return Err(RingError::NotInitialized(name.to_string()));
                }
                if found != capacity {
                    return Err(RingError::CapacityMismatch {
                        requested: capacity,
                        found,
                    });
                }
                info!("Attached to ring {} ({} bytes)", segment.name(), capacity);
                (segment, false)
            }
        };

        Ok(Self {
            inner: Arc::new(RingInner {
                region: Region::Shared(segment),
                capacity,
            }),
            created,
        })
    }

    /// Create a heap-backed ring for threads of this process
    pub fn in_process(capacity: usize) -> Result<Self> {
        validate_capacity(capacity)?;

        let layout = Layout::from_size_align(CONTROL_BLOCK_SIZE + capacity, 64)
            .map_err(|_| RingError::InvalidCapacity(capacity))?;
        // SAFETY: layout has non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(RingError::InvalidCapacity(capacity))?;

        let inner = RingInner {
            region: Region::Heap { ptr, layout },
            capacity,
        };
        inner.control().initialize(capacity as u64);
        debug!("Created in-process ring with {} byte data region", capacity);

        Ok(Self {
            inner: Arc::new(inner),
            created: true,
        })
    }

    /// Whether this handle created the ring rather than attaching to it
    ///
    /// Only the creator should unlink a shared memory ring.
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Remove a shared memory ring name
    ///
    /// Existing mappings stay usable. A missing segment is not an error.
    #[cfg(unix)]
    pub fn unlink(name: &str) -> Result<()> {
        ShmSegment::unlink(name)
    }

    /// Take the producer role, recording this process id
    pub fn into_producer(self) -> RingProducer {
        self.inner
            .control()
            .writer_pid
            .store(std::process::id(), Ordering::Relaxed);
        RingProducer { inner: self.inner }
    }

    /// Take the consumer role, recording this process id
    pub fn into_consumer(self) -> RingConsumer {
        self.inner
            .control()
            .reader_pid
            .store(std::process::id(), Ordering::Relaxed);
        RingConsumer { inner: self.inner }
    }

    /// Take both roles for use from two threads of this process
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let consumer = SharedRingBuffer {
            inner: Arc::clone(&self.inner),
            created: self.created,
        }
        .into_consumer();
        (self.into_producer(), consumer)
    }

    ring_status!();
}

/// Writing end of a ring
pub struct RingProducer {
    inner: Arc<RingInner>,
}

impl RingProducer {
    /// Append one message
    ///
    /// Messages longer than half the capacity are rejected outright. When
    /// the ring lacks room for the message and its length prefix nothing is
    /// written and `Full` is returned.
    pub fn write(&mut self, message: &[u8]) -> Result<()> {
        let ring = &*self.inner;
        let max = ring.capacity / 2;
        if message.len() > max {
            return Err(RingError::MessageTooLarge {
                len: message.len(),
                max,
            });
        }

        let needed = message.len() + LENGTH_PREFIX;
        let control = ring.control();
        let write = control.write_pos.load(Ordering::Relaxed);
        let read = control.read_pos.load(Ordering::Acquire);
        let used = (write.wrapping_sub(read) as usize).min(ring.capacity);
        let available = ring.capacity - used;
        if available < needed {
            return Err(RingError::Full { needed, available });
        }

        // Capacity is bounded by u32::MAX, so the length fits
        ring.copy_in(write, &(message.len() as u32).to_le_bytes());
        ring.copy_in(write + LENGTH_PREFIX as u64, message);
        control
            .write_pos
            .store(write + needed as u64, Ordering::Release);
        Ok(())
    }

    ring_status!();
}

/// Reading end of a ring
pub struct RingConsumer {
    inner: Arc<RingInner>,
}

impl RingConsumer {
    /// Copy the next message into `buf` and return its length
    ///
    /// If `buf` is too small the message stays in the ring and
    /// `BufferTooSmall` reports the size needed.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.peek_len()?;
        if buf.len() < len {
            return Err(RingError::BufferTooSmall { needed: len });
        }
        self.consume(&mut buf[..len]);
        Ok(len)
    }

    /// Move the next message into `out`, resizing it to fit
    pub fn read_to_vec(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let len = self.peek_len()?;
        out.clear();
        out.resize(len, 0);
        self.consume(out);
        Ok(len)
    }

    /// Length of the next message without consuming it
    pub fn peek_len(&self) -> Result<usize> {
        let ring = &*self.inner;
        let control = ring.control();
        let read = control.read_pos.load(Ordering::Relaxed);
        let write = control.write_pos.load(Ordering::Acquire);
        if write == read {
            return Err(RingError::Empty);
        }

        let unread = (write.wrapping_sub(read) as usize).min(ring.capacity);
        if unread < LENGTH_PREFIX {
            return Err(RingError::Corrupted {
                len: 0,
                available: unread,
            });
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        ring.copy_out(read, &mut prefix);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > unread - LENGTH_PREFIX {
            return Err(RingError::Corrupted {
                len,
                available: unread - LENGTH_PREFIX,
            });
        }
        Ok(len)
    }

    /// Copy out the message whose length was just peeked and release it
    fn consume(&mut self, dst: &mut [u8]) {
        let ring = &*self.inner;
        let control = ring.control();
        let read = control.read_pos.load(Ordering::Relaxed);
        ring.copy_out(read + LENGTH_PREFIX as u64, dst);
        control.read_pos.store(
            read + (LENGTH_PREFIX + dst.len()) as u64,
            Ordering::Release,
        );
    }

    ring_status!();
}

fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity < MIN_CAPACITY || capacity > u32::MAX as usize {
        return Err(RingError::InvalidCapacity(capacity));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn ring(capacity: usize) -> (RingProducer, RingConsumer) {
        SharedRingBuffer::in_process(capacity).unwrap().split()
    }

    #[test]
    fn test_write_accounts_for_prefix() {
        let (mut producer, consumer) = ring(1024);
        producer.write(&[7u8; 100]).unwrap();
        assert_eq!(consumer.available_read(), 104);
        assert_eq!(producer.available_write(), 920);
        assert!(!consumer.is_empty());
    }

    #[test]
    fn test_half_capacity_limit() {
        let (mut producer, _consumer) = ring(1024);
        assert!(matches!(
            producer.write(&[0u8; 513]),
            Err(RingError::MessageTooLarge { len: 513, max: 512 })
        ));
        assert_eq!(producer.available_write(), 1024);
        producer.write(&[0u8; 512]).unwrap();
    }

    #[test]
    fn test_full_writes_nothing() {
        let (mut producer, mut consumer) = ring(1024);
        producer.write(&[1u8; 500]).unwrap();
        producer.write(&[2u8; 500]).unwrap();
        producer.write(&[3u8; 12]).unwrap();
        assert_eq!(producer.available_write(), 0);

        assert!(matches!(
            producer.write(&[]),
            Err(RingError::Full { needed: 4, available: 0 })
        ));
        assert_eq!(consumer.available_read(), 1024);

        let mut buf = [0u8; 512];
        assert_eq!(consumer.read(&mut buf).unwrap(), 500);
        assert_eq!(buf[0], 1);
        producer.write(&[]).unwrap();
    }

    #[test]
    fn test_empty() {
        let (_producer, mut consumer) = ring(64);
        let mut buf = [0u8; 16];
        assert!(matches!(consumer.read(&mut buf), Err(RingError::Empty)));
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_small_buffer_keeps_message() {
        let (mut producer, mut consumer) = ring(64);
        producer.write(b"0123456789").unwrap();

        let mut small = [0u8; 4];
        assert!(matches!(
            consumer.read(&mut small),
            Err(RingError::BufferTooSmall { needed: 10 })
        ));
        assert_eq!(consumer.available_read(), 14);

        let mut buf = [0u8; 16];
        assert_eq!(consumer.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"0123456789");
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_wraparound_is_byte_exact() {
        let (mut producer, mut consumer) = ring(64);
        let mut buf = Vec::new();

        for round in 0u8..3 {
            let message: Vec<u8> = (0..20).map(|i| round * 20 + i).collect();
            producer.write(&message).unwrap();
            assert_eq!(consumer.read_to_vec(&mut buf).unwrap(), 20);
            assert_eq!(buf, message);
        }
        // Third message started at offset 48 and wrapped into the head
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_empty_message() {
        let (mut producer, mut consumer) = ring(64);
        producer.write(&[]).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(consumer.read(&mut buf).unwrap(), 0);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_roles_record_pid() {
        let ring = SharedRingBuffer::in_process(64).unwrap();
        assert_eq!(ring.writer_pid(), 0);
        let (producer, consumer) = ring.split();
        assert_eq!(producer.writer_pid(), std::process::id());
        assert_eq!(consumer.reader_pid(), std::process::id());
    }

    #[test]
    fn test_in_process_ring_is_creator() {
        assert!(SharedRingBuffer::in_process(64).unwrap().is_creator());
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            SharedRingBuffer::in_process(4),
            Err(RingError::InvalidCapacity(4))
        ));
    }

    #[test]
    fn test_threads_preserve_order() {
        const COUNT: u32 = 10_000;
        let (mut producer, mut consumer) = ring(4096);

        let writer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let mut message = i.to_le_bytes().to_vec();
                message.resize(4 + (i % 50) as usize, i as u8);
                loop {
                    match producer.write(&message) {
                        Ok(()) => break,
                        Err(RingError::Full { .. }) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected write error: {e}"),
                    }
                }
            }
        });

        let mut buf = Vec::new();
        let mut expected = 0u32;
        while expected < COUNT {
            match consumer.read_to_vec(&mut buf) {
                Ok(len) => {
                    assert_eq!(len, 4 + (expected % 50) as usize);
                    assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), expected);
                    assert!(buf[4..].iter().all(|&b| b == expected as u8));
                    expected += 1;
                }
                Err(RingError::Empty) => std::thread::yield_now(),
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }

        writer.join().unwrap();
        assert!(consumer.is_empty());
    }

    #[cfg(target_os = "linux")]
    fn segment_name() -> String {
        format!("/ring_test_{}", uuid::Uuid::new_v4().simple())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shared_memory_create_and_attach() {
        let name = segment_name();

        let creator = SharedRingBuffer::open(&name, 4096).unwrap();
        let attacher = SharedRingBuffer::open(&name, 4096).unwrap();
        assert_eq!(attacher.capacity(), 4096);
        assert!(creator.is_creator());
        assert!(!attacher.is_creator());

        assert!(matches!(
            SharedRingBuffer::open(&name, 2048),
            Err(RingError::CapacityMismatch {
                requested: 2048,
                found: 4096
            })
        ));

        let mut producer = creator.into_producer();
        let mut consumer = attacher.into_consumer();
        producer.write(b"frame-1").unwrap();
        producer.write(b"frame-2").unwrap();

        let mut buf = Vec::new();
        consumer.read_to_vec(&mut buf).unwrap();
        assert_eq!(buf, b"frame-1");
        consumer.read_to_vec(&mut buf).unwrap();
        assert_eq!(buf, b"frame-2");

        assert_eq!(consumer.writer_pid(), std::process::id());
        assert_eq!(producer.reader_pid(), std::process::id());

        SharedRingBuffer::unlink(&name).unwrap();
        // Unlinking twice is fine
        SharedRingBuffer::unlink(&name).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_uninitialised_segment_detected() {
        let name = segment_name();
        let c_name = std::ffi::CString::new(name.clone()).unwrap();
        // SAFETY: valid C string; descriptor closed right away
        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
            assert!(fd >= 0);
            libc::close(fd);
        }

        assert!(matches!(
            SharedRingBuffer::open(&name, 4096),
            Err(RingError::NotInitialized(_))
        ));
        SharedRingBuffer::unlink(&name).unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0usize..=128).prop_map(Op::Write), Just(Op::Read)]
    }

    proptest! {
        #[test]
        fn prop_fifo_matches_queue(ops in proptest::collection::vec(op(), 1..200)) {
            let (mut producer, mut consumer) = ring(256);
            let mut model: VecDeque<Vec<u8>> = VecDeque::new();
            let mut used = 0usize;
            let mut next = 0u8;
            let mut buf = Vec::new();

            for op in ops {
                match op {
                    Op::Write(len) => {
                        let message: Vec<u8> = (0..len).map(|i| next.wrapping_add(i as u8)).collect();
                        next = next.wrapping_add(1);
                        match producer.write(&message) {
                            Ok(()) => {
                                used += len + LENGTH_PREFIX;
                                model.push_back(message);
                            }
                            Err(RingError::Full { needed, available }) => {
                                prop_assert_eq!(needed, len + LENGTH_PREFIX);
                                prop_assert_eq!(available, 256 - used);
                                prop_assert!(available < needed);
                            }
                            Err(e) => prop_assert!(false, "unexpected error {}", e),
                        }
                    }
                    Op::Read => match model.pop_front() {
                        Some(expected) => {
                            consumer.read_to_vec(&mut buf).unwrap();
                            used -= expected.len() + LENGTH_PREFIX;
                            prop_assert_eq!(&buf, &expected);
                        }
                        None => prop_assert!(matches!(consumer.read_to_vec(&mut buf), Err(RingError::Empty))),
                    },
                }
                prop_assert_eq!(consumer.available_read(), used);
            }
        }
    }
}
