//! Bridge Assembly
//!
//! Wires registry, source, batcher, ring, scheduler and publisher together.
//! Start order is consumer first, then the real-time task; `stop` runs in
//! reverse. A shared memory ring is unlinked only by the bridge that
//! created it, including when start fails after the ring was opened.

use std::sync::Arc;
use std::time::Duration;

use ring_buffer::{RingConfig, SharedRingBuffer};
use rt_scheduler::{has_rt_preempt, select_backend, LatencySummary, PeriodicTask, RtBackend};
use sample_batcher::VariableBatch;
use tracing::{info, warn};
use wire_protocol::CompressedFrameBuilder;

use crate::config::BridgeConfig;
use crate::pipeline::{BridgeCounters, ConsumerWorker, FrameHandler, ProducerTask};
use crate::publisher::Publisher;
use crate::registry::VariableRegistry;
use crate::source::SimulatedSource;
use crate::stats::StatsSource;
use crate::BridgeError;

/// How long the consumer sleeps when the ring is empty
const CONSUMER_IDLE: Duration = Duration::from_micros(500);

/// A running bridge
pub struct Bridge {
    config: BridgeConfig,
    registry: Arc<VariableRegistry>,
    counters: Arc<BridgeCounters>,
    task: PeriodicTask,
    consumer: Option<ConsumerWorker>,
    ring_capacity: usize,
    owns_ring: bool,
    stopped: bool,
}

#[cfg(unix)]
fn open_ring(config: &RingConfig) -> Result<SharedRingBuffer, BridgeError> {
    if config.in_process {
        Ok(SharedRingBuffer::in_process(config.capacity)?)
    } else {
        Ok(SharedRingBuffer::open(&config.name, config.capacity)?)
    }
}

#[cfg(not(unix))]
fn open_ring(config: &RingConfig) -> Result<SharedRingBuffer, BridgeError> {
    if !config.in_process {
        warn!("Shared memory rings need a unix host, using an in-process ring");
    }
    Ok(SharedRingBuffer::in_process(config.capacity)?)
}

/// Unlink the segment if this bridge created it and is asked to
#[cfg(unix)]
fn release_ring(config: &RingConfig, owns_ring: bool) {
    if owns_ring && config.unlink_on_exit {
        if let Err(e) = SharedRingBuffer::unlink(&config.name) {
            warn!("Failed to unlink ring {}: {}", config.name, e);
        }
    }
}

#[cfg(not(unix))]
fn release_ring(_config: &RingConfig, _owns_ring: bool) {}

impl Bridge {
    /// Open the ring and start the consumer and the periodic task
    pub fn start(config: BridgeConfig, publisher: Arc<dyn Publisher>) -> Result<Self, BridgeError> {
        let backend = select_backend(config.realtime.backend)?;
        Self::start_with_backend(config, publisher, backend)
    }

    /// Like [`Bridge::start`], running the periodic task on `backend`
    pub fn start_with_backend(
        config: BridgeConfig,
        publisher: Arc<dyn Publisher>,
        backend: Arc<dyn RtBackend>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let registry = Arc::new(VariableRegistry::from_specs(&config.variables())?);
        info!(
            "Bridging {} variables from {} ({}:{})",
            registry.len(),
            config.device.name,
            config.device.target,
            config.device.port
        );
        if !has_rt_preempt() {
            warn!("Kernel is not PREEMPT_RT, expect higher cycle jitter");
        }

        let ring = open_ring(&config.ring)?;
        let owns_ring = !config.ring.in_process && ring.is_creator();
        let ring_config = config.ring.clone();

        match Self::assemble(config, registry, ring, publisher, backend, owns_ring) {
            Ok(bridge) => Ok(bridge),
            Err(e) => {
                release_ring(&ring_config, owns_ring);
                Err(e)
            }
        }
    }

    fn assemble(
        config: BridgeConfig,
        registry: Arc<VariableRegistry>,
        ring: SharedRingBuffer,
        publisher: Arc<dyn Publisher>,
        backend: Arc<dyn RtBackend>,
        owns_ring: bool,
    ) -> Result<Self, BridgeError> {
        let ring_capacity = ring.capacity();
        let (producer, consumer) = ring.split();
        let counters = Arc::new(BridgeCounters::new());

        let handler = FrameHandler::new(
            publisher,
            &config.mqtt.topic_prefix,
            config.mqtt.publish_mode,
            Arc::clone(&counters),
        );
        let mut consumer = ConsumerWorker::spawn(consumer, handler, CONSUMER_IDLE)?;

        let source = SimulatedSource::new(
            &config.device.name,
            Arc::clone(&registry),
            config.device.sample_every_cycles,
        );
        let batch = VariableBatch::new(
            config.batch.clone(),
            CompressedFrameBuilder::new(config.compression.enabled),
        );
        let mut producer = ProducerTask::new(Box::new(source), batch, producer, Arc::clone(&counters));

        let mut task = PeriodicTask::with_backend(config.realtime.clone(), backend);
        if let Err(e) = task.start(move || producer.run_cycle()) {
            consumer.stop();
            return Err(e.into());
        }

        info!(
            "Bridge running: {}us period on {} backend, {} byte ring",
            config.realtime.period_us,
            task.backend_name(),
            ring_capacity
        );

        Ok(Self {
            config,
            registry,
            counters,
            task,
            consumer: Some(consumer),
            ring_capacity,
            owns_ring,
            stopped: false,
        })
    }

    /// Stop the periodic task, drain the ring and release it
    ///
    /// Blocks until both threads have exited.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.task.stop();
        if let Some(mut consumer) = self.consumer.take() {
            consumer.stop();
        }
        release_ring(&self.config.ring, self.owns_ring);

        let counters = self.counters.snapshot();
        info!(
            "Bridge stopped: {} frames written, {} dropped, {} messages published",
            counters.frames_written, counters.frames_dropped, counters.messages_published
        );
    }

    /// Whether the periodic task and the consumer are both alive
    pub fn is_running(&self) -> bool {
        self.task.is_running() && self.consumer.as_ref().is_some_and(|c| c.is_running())
    }

    pub fn stats_source(&self) -> StatsSource {
        StatsSource {
            device: self.config.device.name.clone(),
            backend: self.task.backend_name(),
            latency: self.task.stats_handle(),
            counters: Arc::clone(&self.counters),
            ring_capacity: self.ring_capacity,
        }
    }

    pub fn latency(&self) -> LatencySummary {
        self.task.latency_stats()
    }

    pub fn counters(&self) -> &Arc<BridgeCounters> {
        &self.counters
    }

    pub fn registry(&self) -> &Arc<VariableRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishMode;
    use crate::publisher::testing::RecordingPublisher;
    use rt_scheduler::{BackendKind, RtConfig, RtThread, SchedulerError, TaskBody};

    fn test_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.realtime.backend = BackendKind::Elevated;
        config.realtime.lock_memory = false;
        config.realtime.period_us = 1_000;
        config.realtime.max_deviation_us = 50_000;
        config.ring.in_process = true;
        config.ring.capacity = 256 * 1024;
        config.batch.batch_timeout_us = 5_000;
        config
    }

    #[test]
    fn test_end_to_end_in_process() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut bridge = Bridge::start(test_config(), publisher.clone()).unwrap();
        assert!(bridge.is_running());
        assert_eq!(bridge.registry().len(), 5);

        std::thread::sleep(Duration::from_millis(100));
        bridge.stop();
        assert!(!bridge.is_running());

        let counters = bridge.counters().snapshot();
        assert!(counters.samples > 0);
        assert!(counters.frames_written > 0);
        assert_eq!(counters.frames_received, counters.frames_written);
        assert_eq!(counters.decode_errors, 0);
        assert_eq!(counters.frames_lost, 0);
        assert!(bridge.latency().count > 0);

        let topics = publisher.topics();
        assert!(topics.iter().any(|t| t == "plc/GVL.temperature"));
        assert!(topics.iter().all(|t| t.starts_with("plc/GVL.")));
    }

    #[test]
    fn test_frame_mode_topic() {
        let mut config = test_config();
        config.mqtt.publish_mode = PublishMode::Frame;
        config.mqtt.topic_prefix = "line1".to_string();

        let publisher = Arc::new(RecordingPublisher::default());
        let mut bridge = Bridge::start(config, publisher.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        bridge.stop();

        let topics = publisher.topics();
        assert!(!topics.is_empty());
        assert!(topics.iter().all(|t| t == "line1/frames"));
    }

    #[test]
    fn test_stats_source_reflects_task() {
        let publisher = Arc::new(RecordingPublisher::default());
        let bridge = Bridge::start(test_config(), publisher).unwrap();
        let stats = bridge.stats_source().snapshot();
        assert_eq!(stats.device, "plc-sim");
        assert_eq!(stats.backend, "elevated");
        assert_eq!(stats.ring_capacity, 256 * 1024);
    }

    #[test]
    fn test_invalid_variables_fail_start() {
        let mut config = test_config();
        config.variables = vec![crate::config::VariableSpec::new("GVL.blob", wire_protocol::DataType::Custom)];
        let publisher = Arc::new(RecordingPublisher::default());
        assert!(matches!(
            Bridge::start(config, publisher),
            Err(BridgeError::InvalidVariable { .. })
        ));
    }

    /// Backend that cannot start threads
    struct NoThreadsBackend;

    impl RtBackend for NoThreadsBackend {
        fn name(&self) -> &'static str {
            "no-threads"
        }

        fn lock_memory(&self) -> Result<(), SchedulerError> {
            Ok(())
        }

        fn unlock_memory(&self) {}

        fn spawn(&self, _config: &RtConfig, _body: TaskBody) -> Result<RtThread, SchedulerError> {
            Err(SchedulerError::Spawn(std::io::Error::from(std::io::ErrorKind::WouldBlock)))
        }

        fn now_ns(&self) -> u64 {
            0
        }

        fn sleep_until_ns(&self, _deadline_ns: u64) {}
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let publisher = Arc::new(RecordingPublisher::default());
        assert!(matches!(
            Bridge::start_with_backend(test_config(), publisher, Arc::new(NoThreadsBackend)),
            Err(BridgeError::Scheduler(SchedulerError::Spawn(_)))
        ));
    }

    #[cfg(target_os = "linux")]
    fn shared_config() -> BridgeConfig {
        let mut config = test_config();
        config.ring.in_process = false;
        config.ring.unlink_on_exit = true;
        config.ring.name = format!("/bridge_test_{}", uuid::Uuid::new_v4().simple());
        config
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_start_unlinks_created_ring() {
        let config = shared_config();
        let name = config.ring.name.clone();
        let capacity = config.ring.capacity;

        let publisher = Arc::new(RecordingPublisher::default());
        assert!(Bridge::start_with_backend(config, publisher, Arc::new(NoThreadsBackend)).is_err());

        // The name was removed, so this open creates a fresh segment
        let reopened = SharedRingBuffer::open(&name, capacity).unwrap();
        assert!(reopened.is_creator());
        SharedRingBuffer::unlink(&name).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_attached_ring_is_left_in_place() {
        let config = shared_config();
        let name = config.ring.name.clone();
        let capacity = config.ring.capacity;
        let owner = SharedRingBuffer::open(&name, capacity).unwrap();
        assert!(owner.is_creator());

        let publisher = Arc::new(RecordingPublisher::default());
        let mut bridge = Bridge::start(config, publisher).unwrap();
        bridge.stop();

        let reopened = SharedRingBuffer::open(&name, capacity).unwrap();
        assert!(!reopened.is_creator());
        SharedRingBuffer::unlink(&name).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_created_ring_unlinked_on_stop() {
        let config = shared_config();
        let name = config.ring.name.clone();
        let capacity = config.ring.capacity;

        let publisher = Arc::new(RecordingPublisher::default());
        let mut bridge = Bridge::start(config, publisher).unwrap();
        bridge.stop();

        let reopened = SharedRingBuffer::open(&name, capacity).unwrap();
        assert!(reopened.is_creator());
        SharedRingBuffer::unlink(&name).unwrap();
    }
}
