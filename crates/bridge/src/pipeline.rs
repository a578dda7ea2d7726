//! Sample Pipeline
//!
//! The real-time half ([`ProducerTask`]) polls a source, batches samples
//! and writes encoded frames into the ring. The other half
//! ([`ConsumerWorker`]) drains the ring on an ordinary thread, decodes the
//! frames and hands them to a [`Publisher`].
//!
//! The producer never logs or blocks; everything it observes goes into
//! [`BridgeCounters`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ring_buffer::{RingConsumer, RingError, RingProducer};
use sample_batcher::VariableBatch;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use wire_protocol::{decode_frame, decompress_frame, FrameEncoder};

use crate::config::PublishMode;
use crate::publisher::Publisher;
use crate::source::VariableSource;
use crate::BridgeError;

/// Shared pipeline counters
#[derive(Debug, Default)]
pub struct BridgeCounters {
    pub samples: AtomicU64,
    pub frames_written: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Frames dropped because the ring was full
    pub frames_dropped: AtomicU64,
    /// Frames that could not be encoded or were too large for the ring
    pub frames_rejected: AtomicU64,
    pub frames_received: AtomicU64,
    pub messages_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub decode_errors: AtomicU64,
    /// Frames missing according to sequence numbers
    pub frames_lost: AtomicU64,
    /// Bytes waiting in the ring after the last read
    pub ring_fill: AtomicU64,
}

/// Point-in-time copy of [`BridgeCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub samples: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub frames_dropped: u64,
    pub frames_rejected: u64,
    pub frames_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub decode_errors: u64,
    pub frames_lost: u64,
    pub ring_fill: u64,
}

impl BridgeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CounterSnapshot {
            samples: load(&self.samples),
            frames_written: load(&self.frames_written),
            bytes_written: load(&self.bytes_written),
            frames_dropped: load(&self.frames_dropped),
            frames_rejected: load(&self.frames_rejected),
            frames_received: load(&self.frames_received),
            messages_published: load(&self.messages_published),
            publish_failures: load(&self.publish_failures),
            decode_errors: load(&self.decode_errors),
            frames_lost: load(&self.frames_lost),
            ring_fill: load(&self.ring_fill),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// The per-cycle body of the real-time thread
///
/// Dropping the task flushes whatever is still batched.
pub struct ProducerTask<E: FrameEncoder> {
    source: Box<dyn VariableSource>,
    batch: VariableBatch<E>,
    producer: RingProducer,
    counters: Arc<BridgeCounters>,
}

impl<E: FrameEncoder> ProducerTask<E> {
    pub fn new(
        source: Box<dyn VariableSource>,
        batch: VariableBatch<E>,
        producer: RingProducer,
        counters: Arc<BridgeCounters>,
    ) -> Self {
        Self {
            source,
            batch,
            producer,
            counters,
        }
    }

    /// Poll once and write a frame if the batch is ready
    ///
    /// A batch becomes ready by size or by age, so an idle source still
    /// gets its last samples out.
    pub fn run_cycle(&mut self) {
        let batch = &mut self.batch;
        let mut ready = false;
        let samples = self.source.poll(&mut |sample| {
            ready |= batch.add_at(sample.name, sample.data_type, sample.value, sample.timestamp_us);
        });
        bump(&self.counters.samples, samples as u64);

        if ready || self.batch.should_flush() {
            self.flush();
        }
    }

    /// Encode pending samples and write them to the ring
    pub fn flush(&mut self) {
        match self.batch.flush() {
            Ok(Some(frame)) => self.write_frame(&frame),
            Ok(None) => {}
            Err(_) => {
                self.batch.clear();
                bump(&self.counters.frames_rejected, 1);
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) {
        match self.producer.write(frame) {
            Ok(()) => {
                bump(&self.counters.frames_written, 1);
                bump(&self.counters.bytes_written, frame.len() as u64);
            }
            Err(RingError::Full { .. }) => bump(&self.counters.frames_dropped, 1),
            Err(_) => bump(&self.counters.frames_rejected, 1),
        }
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }
}

impl<E: FrameEncoder> Drop for ProducerTask<E> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Decodes frames read from the ring and publishes their contents
pub struct FrameHandler {
    publisher: Arc<dyn Publisher>,
    topic_prefix: String,
    mode: PublishMode,
    expected_sequence: Option<u32>,
    counters: Arc<BridgeCounters>,
}

impl FrameHandler {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topic_prefix: &str,
        mode: PublishMode,
        counters: Arc<BridgeCounters>,
    ) -> Self {
        Self {
            publisher,
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            mode,
            expected_sequence: None,
            counters,
        }
    }

    /// Decode one frame and publish it
    ///
    /// Returns the number of messages published. Publish failures are
    /// counted, not returned; only malformed frames are errors.
    pub fn handle(&mut self, raw: &[u8]) -> Result<usize, BridgeError> {
        bump(&self.counters.frames_received, 1);

        let bytes = decompress_frame(raw)?;
        let frame = decode_frame(&bytes)?;
        self.track_sequence(frame.header.sequence);

        let mut published = 0;
        match self.mode {
            PublishMode::PerVariable => {
                for variable in &frame.variables {
                    let topic = format!("{}/{}", self.topic_prefix, variable.name);
                    if self.send(&topic, variable.value) {
                        published += 1;
                    }
                }
            }
            PublishMode::Frame => {
                let topic = format!("{}/frames", self.topic_prefix);
                let total = frame.header.total_size as usize;
                if self.send(&topic, &bytes[..total]) {
                    published += 1;
                }
            }
        }
        Ok(published)
    }

    fn send(&self, topic: &str, payload: &[u8]) -> bool {
        match self.publisher.publish(topic, payload) {
            Ok(()) => {
                bump(&self.counters.messages_published, 1);
                true
            }
            Err(e) => {
                bump(&self.counters.publish_failures, 1);
                debug!("Publish to {} failed: {}", topic, e);
                false
            }
        }
    }

    fn track_sequence(&mut self, sequence: u32) {
        if let Some(expected) = self.expected_sequence {
            if sequence != expected {
                let gap = sequence.wrapping_sub(expected);
                if gap < u32::MAX / 2 {
                    bump(&self.counters.frames_lost, u64::from(gap));
                    warn!("Sequence gap: expected {}, got {} ({} frames lost)", expected, sequence, gap);
                } else {
                    warn!("Sequence restarted: expected {}, got {}", expected, sequence);
                }
            }
        }
        self.expected_sequence = Some(sequence.wrapping_add(1));
    }

    /// Sequence number the next frame should carry
    pub fn expected_sequence(&self) -> Option<u32> {
        self.expected_sequence
    }
}

/// Thread draining the ring into a [`FrameHandler`]
pub struct ConsumerWorker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ConsumerWorker {
    /// Start draining `consumer`, sleeping `idle` whenever the ring is empty
    pub fn spawn(
        mut consumer: RingConsumer,
        mut handler: FrameHandler,
        idle: Duration,
    ) -> Result<Self, BridgeError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("ring-consumer".to_string())
            .spawn(move || {
                let counters = Arc::clone(&handler.counters);
                let mut buf = Vec::new();
                loop {
                    match consumer.read_to_vec(&mut buf) {
                        Ok(_) => {
                            counters
                                .ring_fill
                                .store(consumer.available_read() as u64, Ordering::Relaxed);
                            if let Err(e) = handler.handle(&buf) {
                                bump(&counters.decode_errors, 1);
                                warn!("Dropping undecodable frame ({} bytes): {}", buf.len(), e);
                            }
                        }
                        Err(RingError::Empty) => {
                            counters.ring_fill.store(0, Ordering::Relaxed);
                            // Drain fully before honouring a stop request
                            if !flag.load(Ordering::Acquire) {
                                break;
                            }
                            thread::sleep(idle);
                        }
                        Err(e) => {
                            error!("Ring buffer unreadable, consumer stopping: {}", e);
                            break;
                        }
                    }
                }
                info!("Ring consumer stopped");
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Drain what is left in the ring, then join
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Ring consumer panicked");
            }
        }
    }
}

impl Drop for ConsumerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
