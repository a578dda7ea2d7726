//! Variable Batch

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;
use wire_protocol::{timestamp_us, DataType, FrameBuilder, FrameEncoder, ProtocolError, Variable};

/// Batch flush thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush once this many samples are pending
    pub max_batch_size: usize,
    /// Flush once this long has passed since the last flush (µs)
    pub batch_timeout_us: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_timeout_us: 10_000,
        }
    }
}

impl BatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.batch_timeout_us)
    }
}

/// One pending sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub name: String,
    pub data_type: DataType,
    pub data: Vec<u8>,
    /// Capture time in microseconds
    pub timestamp_us: u64,
}

/// Accumulator for samples waiting to be sent as one Batch frame
///
/// The encoder owns the frame sequence counter, so clearing a batch never
/// resets it.
#[derive(Debug)]
pub struct VariableBatch<E: FrameEncoder = FrameBuilder> {
    entries: Vec<BatchEntry>,
    config: BatchConfig,
    last_flush: Instant,
    encoder: E,
}

impl VariableBatch<FrameBuilder> {
    /// Create a batch that encodes plain uncompressed frames
    pub fn with_config(config: BatchConfig) -> Self {
        Self::new(config, FrameBuilder::new())
    }
}

impl<E: FrameEncoder> VariableBatch<E> {
    /// Create a batch around an encoder
    pub fn new(config: BatchConfig, encoder: E) -> Self {
        Self {
            entries: Vec::with_capacity(config.max_batch_size),
            config,
            last_flush: Instant::now(),
            encoder,
        }
    }

    /// Add an untyped sample
    ///
    /// Returns true when the batch should now be flushed.
    pub fn add(&mut self, name: &str, data: &[u8]) -> bool {
        self.add_typed(name, DataType::Custom, data)
    }

    /// Add a sample with an explicit type tag
    ///
    /// Returns true when the batch should now be flushed.
    pub fn add_typed(&mut self, name: &str, data_type: DataType, data: &[u8]) -> bool {
        self.add_at(name, data_type, data, timestamp_us())
    }

    /// Add a sample with the time it was captured at the source
    pub fn add_at(&mut self, name: &str, data_type: DataType, data: &[u8], timestamp_us: u64) -> bool {
        self.entries.push(BatchEntry {
            name: name.to_string(),
            data_type,
            data: data.to_vec(),
            timestamp_us,
        });
        self.should_flush()
    }

    /// Whether the size or time threshold has been reached
    pub fn should_flush(&self) -> bool {
        self.entries.len() >= self.config.max_batch_size
            || self.last_flush.elapsed() >= self.config.timeout()
    }

    /// Encode all pending samples as one Batch frame
    ///
    /// Works regardless of readiness and leaves the entries in place.
    pub fn serialize(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let variables: Vec<Variable<'_>> = self
            .entries
            .iter()
            .map(|entry| {
                Variable::new(&entry.name, entry.data_type, &entry.data)
                    .with_timestamp(entry.timestamp_us)
            })
            .collect();

        self.encoder.encode_batch(&variables)
    }

    /// Drop pending samples and restart the flush clock
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_flush = Instant::now();
    }

    /// Serialize and clear when there is anything pending
    ///
    /// On encode failure the entries are kept.
    pub fn flush(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.entries.is_empty() {
            self.last_flush = Instant::now();
            return Ok(None);
        }

        let frame = self.serialize()?;
        debug!("Flushed batch of {} samples ({} bytes)", self.entries.len(), frame.len());
        self.clear();
        Ok(Some(frame))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Encoder used for serialization
    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wire_protocol::{decode_frame, decode_header, CompressedFrameBuilder, PayloadType};

    fn config(max_batch_size: usize, batch_timeout_us: u64) -> BatchConfig {
        BatchConfig {
            max_batch_size,
            batch_timeout_us,
        }
    }

    #[test]
    fn test_default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.batch_timeout_us, 10_000);
    }

    #[test]
    fn test_flush_on_size() {
        let mut batch = VariableBatch::with_config(config(3, 60_000_000));
        assert!(!batch.add("GVL.a", &[1]));
        assert!(!batch.add("GVL.b", &[2]));
        assert!(batch.add("GVL.c", &[3]));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_flush_on_timeout() {
        let mut batch = VariableBatch::with_config(config(100, 1_000));
        std::thread::sleep(Duration::from_millis(5));
        assert!(batch.should_flush());
        assert!(batch.add("GVL.a", &[1]));
    }

    #[test]
    fn test_serialize_preserves_order_and_types() {
        let mut batch = VariableBatch::with_config(config(10, 60_000_000));
        batch.add_typed("GVL.speed", DataType::Real32, &3.5f32.to_le_bytes());
        batch.add("GVL.raw", &[9, 8, 7]);

        let frame = batch.serialize().unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.header.payload_type, PayloadType::Batch);
        assert_eq!(decoded.header.var_count, 2);

        assert_eq!(decoded.variables[0].name, "GVL.speed");
        assert_eq!(decoded.variables[0].data_type, DataType::Real32);
        assert_eq!(decoded.variables[1].name, "GVL.raw");
        assert_eq!(decoded.variables[1].data_type, DataType::Custom);
        assert_eq!(decoded.variables[1].value, &[9, 8, 7]);

        for (var, entry) in decoded.variables.iter().zip(batch.entries()) {
            assert_eq!(var.timestamp_us, entry.timestamp_us);
        }
        // serialize leaves entries in place
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_capture_timestamp_kept() {
        let mut batch = VariableBatch::with_config(config(10, 60_000_000));
        batch.add_at("GVL.a", DataType::UInt8, &[1], 1_234);
        let frame = batch.serialize().unwrap();
        assert_eq!(decode_frame(&frame).unwrap().variables[0].timestamp_us, 1_234);
    }

    #[test]
    fn test_clear_keeps_sequence() {
        let mut batch = VariableBatch::with_config(config(10, 60_000_000));
        batch.add("GVL.a", &[1]);
        let first = batch.serialize().unwrap();
        batch.clear();
        assert!(batch.is_empty());

        batch.add("GVL.a", &[2]);
        let second = batch.serialize().unwrap();

        assert_eq!(decode_header(&first).unwrap().sequence, 0);
        assert_eq!(decode_header(&second).unwrap().sequence, 1);
        assert_eq!(batch.encoder().sequence(), 2);
    }

    #[test]
    fn test_flush_empty_and_nonempty() {
        let mut batch = VariableBatch::with_config(config(10, 60_000_000));
        assert_eq!(batch.flush().unwrap(), None);

        batch.add("GVL.a", &[1]);
        let frame = batch.flush().unwrap().unwrap();
        assert_eq!(decode_frame(&frame).unwrap().variables.len(), 1);
        assert!(batch.is_empty());
        assert!(!batch.should_flush());
    }

    #[test]
    fn test_compressing_encoder() {
        let mut batch = VariableBatch::new(config(20, 60_000_000), CompressedFrameBuilder::new(true));
        let mut ready = false;
        for i in 0..20 {
            ready = batch.add_typed(&format!("GVL.sensor_{i:02}"), DataType::Int32, &[0, 0, 0, 0]);
        }
        assert!(ready);

        let frame = batch.flush().unwrap().unwrap();
        assert_eq!(decode_header(&frame).unwrap().payload_type, PayloadType::Compressed);

        let restored = wire_protocol::decompress_frame(&frame).unwrap();
        assert_eq!(decode_frame(&restored).unwrap().variables.len(), 20);
    }

    proptest! {
        #[test]
        fn prop_ready_iff_size_reached(max in 1usize..50, adds in 0usize..60) {
            let mut batch = VariableBatch::with_config(config(max, 3_600_000_000));
            let mut last = false;
            for i in 0..adds {
                last = batch.add(&format!("v{i}"), &[i as u8]);
            }
            prop_assert_eq!(batch.len(), adds);
            if adds > 0 {
                prop_assert_eq!(last, adds >= max);
            }
        }
    }
}
