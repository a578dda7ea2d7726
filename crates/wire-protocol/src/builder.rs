//! Frame Builder

use crate::header::{DataType, FrameHeader, PayloadType, VarHeader};
use crate::{timestamp_us, ProtocolError, FRAME_HEADER_SIZE, PROTOCOL_VERSION, VAR_HEADER_SIZE};

/// One named value to encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable<'a> {
    pub name: &'a str,
    pub data_type: DataType,
    pub value: &'a [u8],
    /// Capture time in microseconds
    pub timestamp_us: u64,
}

impl<'a> Variable<'a> {
    /// Create a variable stamped with the current time
    pub fn new(name: &'a str, data_type: DataType, value: &'a [u8]) -> Self {
        Self {
            name,
            data_type,
            value,
            timestamp_us: timestamp_us(),
        }
    }

    /// Override the capture timestamp
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Bytes this variable occupies in a frame
    pub fn encoded_len(&self) -> usize {
        VAR_HEADER_SIZE + self.name.len() + self.value.len()
    }

    fn header(&self) -> Result<VarHeader, ProtocolError> {
        let name_len =
            u16::try_from(self.name.len()).map_err(|_| ProtocolError::NameTooLong(self.name.len()))?;
        let data_len = u32::try_from(self.value.len())
            .map_err(|_| ProtocolError::ValueTooLarge(self.value.len()))?;

        Ok(VarHeader {
            name_len,
            data_type: self.data_type,
            data_len,
            timestamp_us: self.timestamp_us,
        })
    }
}

/// Anything that turns variables into frames
///
/// Implemented by [`FrameBuilder`] and by the compression-aware builder so
/// callers can be generic over whether frames get compressed.
pub trait FrameEncoder {
    /// Encode one variable as a Single frame
    fn encode_single(&mut self, variable: &Variable<'_>) -> Result<Vec<u8>, ProtocolError>;

    /// Encode variables, in order, as a Batch frame
    fn encode_batch(&mut self, variables: &[Variable<'_>]) -> Result<Vec<u8>, ProtocolError>;

    /// Sequence number the next frame will carry
    fn sequence(&self) -> u32;
}

/// Builds uncompressed frames and owns the frame sequence counter
#[derive(Debug, Default)]
pub struct FrameBuilder {
    /// Next sequence number (wraps at u32::MAX)
    sequence: u32,
}

impl FrameBuilder {
    /// Create a builder starting at sequence 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder whose first frame carries `sequence`
    pub fn with_sequence(sequence: u32) -> Self {
        Self { sequence }
    }

    /// Build a Single frame from a name, type tag and raw value
    pub fn build_single(
        &mut self,
        name: &str,
        data_type: DataType,
        value: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.encode_single(&Variable::new(name, data_type, value))
    }

    /// Build a Batch frame from variables in order
    pub fn build_batch(&mut self, variables: &[Variable<'_>]) -> Result<Vec<u8>, ProtocolError> {
        self.encode_batch(variables)
    }

    fn build(
        &mut self,
        payload_type: PayloadType,
        variables: &[Variable<'_>],
    ) -> Result<Vec<u8>, ProtocolError> {
        let var_count = u16::try_from(variables.len())
            .map_err(|_| ProtocolError::TooManyVariables(variables.len()))?;

        // First pass: validate and size
        let mut total = FRAME_HEADER_SIZE;
        let mut headers = Vec::with_capacity(variables.len());
        for variable in variables {
            headers.push(variable.header()?);
            total += variable.encoded_len();
        }
        let total_size = u32::try_from(total).map_err(|_| ProtocolError::FrameTooLarge(total))?;

        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            payload_type,
            var_count,
            total_size,
            timestamp_us: timestamp_us(),
            sequence: self.next_sequence(),
        };

        // Second pass: serialize
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&header.encode());
        for (variable, var_header) in variables.iter().zip(&headers) {
            out.extend_from_slice(&var_header.encode());
            out.extend_from_slice(variable.name.as_bytes());
            out.extend_from_slice(variable.value);
        }
        debug_assert_eq!(out.len(), total);

        Ok(out)
    }

    fn next_sequence(&mut self) -> u32 {
        let current = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        current
    }
}

impl FrameEncoder for FrameBuilder {
    fn encode_single(&mut self, variable: &Variable<'_>) -> Result<Vec<u8>, ProtocolError> {
        self.build(PayloadType::Single, std::slice::from_ref(variable))
    }

    fn encode_batch(&mut self, variables: &[Variable<'_>]) -> Result<Vec<u8>, ProtocolError> {
        self.build(PayloadType::Batch, variables)
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }
}
