//! Real-Time Field-Bus Bridge
//!
//! Samples variables on a real-time periodic thread, batches and encodes
//! them into wire frames, passes the frames through a lock-free ring and
//! publishes the decoded values over MQTT from an ordinary thread.
//!
//! ```text
//! source -> ProducerTask (RT) -> ring -> ConsumerWorker -> Publisher
//! ```

mod bridge;
mod config;
mod error;
mod logging;
mod pipeline;
mod publisher;
mod registry;
mod source;
mod stats;

pub use bridge::Bridge;
pub use self::config::{
    BridgeConfig, CompressionConfig, DeviceConfig, MetricsConfig, MqttConfig, PublishMode,
    VariableSpec,
};
pub use error::BridgeError;
pub use logging::init_logging;
pub use pipeline::{BridgeCounters, ConsumerWorker, CounterSnapshot, FrameHandler, ProducerTask};
pub use publisher::{LogPublisher, MqttPublisher, Publisher};
pub use registry::{RegisteredVariable, VariableHandle, VariableRegistry};
pub use source::{Notification, SimulatedSource, VariableSource};
pub use stats::{
    install_metrics_exporter, report, run_stats_reporter, RateTracker, Rates, StatsMessage, StatsSource,
};
