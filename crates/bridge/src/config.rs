//! Bridge Configuration
//!
//! Loaded from an optional TOML/YAML/JSON file and `BRIDGE__*` environment
//! variables, e.g. `BRIDGE__MQTT__BROKER=10.0.0.5` or
//! `BRIDGE__REALTIME__PERIOD_US=250`.

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File};
use ring_buffer::RingConfig;
use rt_scheduler::RtConfig;
use sample_batcher::BatchConfig;
use serde::{Deserialize, Serialize};
use wire_protocol::DataType;

use crate::BridgeError;

/// Default config file looked up in the working directory
const DEFAULT_CONFIG_NAME: &str = "rt-bridge";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    pub realtime: RtConfig,
    pub ring: RingConfig,
    pub batch: BatchConfig,
    pub compression: CompressionConfig,
    pub mqtt: MqttConfig,
    pub metrics: MetricsConfig,
    pub variables: Vec<VariableSpec>,
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
    pub stats_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            realtime: RtConfig::default(),
            ring: RingConfig::default(),
            batch: BatchConfig::default(),
            compression: CompressionConfig::default(),
            mqtt: MqttConfig::default(),
            metrics: MetricsConfig::default(),
            variables: Vec::new(),
            log_level: "info".to_string(),
            log_json: false,
            stats_interval_ms: 1000,
        }
    }
}

/// Field device the samples come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub target: String,
    pub port: u16,
    /// Simulated source emits every variable once per this many cycles
    pub sample_every_cycles: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "plc-sim".to_string(),
            target: "192.168.3.42".to_string(),
            port: 851,
            sample_every_cycles: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// How decoded frames are published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// One message per variable on `{prefix}/{name}` carrying the raw value
    #[default]
    PerVariable,
    /// One message per frame on `{prefix}/frames` carrying the decompressed frame
    Frame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    /// Generated from the device name when absent
    pub client_id: Option<String>,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    /// Requests buffered between the bridge and the MQTT event loop
    pub queue_capacity: usize,
    pub publish_mode: PublishMode,
    /// Log messages instead of sending them
    pub dry_run: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: None,
            topic_prefix: "plc".to_string(),
            keep_alive_secs: 30,
            queue_capacity: 1024,
            publish_mode: PublishMode::PerVariable,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics over HTTP
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
        }
    }
}

/// A variable to sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub data_type: DataType,
    /// Required for string and custom types, implied otherwise
    #[serde(default)]
    pub size: Option<usize>,
}

impl VariableSpec {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            size: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `path` (or `./rt-bridge.*` if present) and
    /// the environment
    pub fn load(path: Option<&Path>) -> Result<Self, BridgeError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config: BridgeConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Variables to sample, falling back to a small demo set
    pub fn variables(&self) -> Vec<VariableSpec> {
        if self.variables.is_empty() {
            default_variables()
        } else {
            self.variables.clone()
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        self.realtime
            .validate()
            .map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;

        if self.batch.max_batch_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "batch.max_batch_size must be positive".to_string(),
            ));
        }
        if self.device.sample_every_cycles == 0 {
            return Err(BridgeError::InvalidConfig(
                "device.sample_every_cycles must be positive".to_string(),
            ));
        }
        if self.stats_interval_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "stats_interval_ms must be positive".to_string(),
            ));
        }
        if self.mqtt.topic_prefix.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "mqtt.topic_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_variables() -> Vec<VariableSpec> {
    vec![
        VariableSpec::new("GVL.running", DataType::Bool),
        VariableSpec::new("GVL.cycle_count", DataType::UInt32),
        VariableSpec::new("GVL.temperature", DataType::Real32),
        VariableSpec::new("GVL.pressure", DataType::Real64),
        VariableSpec::new("GVL.position", DataType::Int32),
    ]
}
