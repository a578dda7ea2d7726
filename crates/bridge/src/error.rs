//! Bridge Error Types

use ring_buffer::RingError;
use rt_scheduler::SchedulerError;
use thiserror::Error;
use wire_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Variable {0} registered twice")]
    DuplicateVariable(String),

    #[error("Variable {name}: {reason}")]
    InvalidVariable { name: String, reason: String },

    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Publisher not connected")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}
