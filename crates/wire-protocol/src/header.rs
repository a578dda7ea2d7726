//! Frame and Variable Headers
//!
//! Fixed-size packed headers with explicit little-endian encoding.

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, FRAME_HEADER_SIZE, VAR_HEADER_SIZE};

/// Byte offset of the payload type within a frame header
pub(crate) const TYPE_OFFSET: usize = 1;
/// Byte offset of total_size within a frame header
pub(crate) const TOTAL_SIZE_OFFSET: usize = 4;

/// Kind of frame body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadType {
    /// Exactly one variable
    Single = 0,
    /// Any number of variables
    Batch = 1,
    /// Codec id followed by a compressed body
    Compressed = 2,
}

impl TryFrom<u8> for PayloadType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::Single),
            1 => Ok(PayloadType::Batch),
            2 => Ok(PayloadType::Compressed),
            other => Err(ProtocolError::UnknownPayloadType(other)),
        }
    }
}

/// Value type tag of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    /// One byte, zero is false
    Bool = 1,
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Unsigned 16-bit integer, little-endian
    UInt16 = 3,
    /// Unsigned 32-bit integer, little-endian
    UInt32 = 4,
    /// Signed 16-bit integer, little-endian
    Int16 = 5,
    /// Signed 32-bit integer, little-endian
    Int32 = 6,
    /// Signed 64-bit integer, little-endian
    Int64 = 7,
    /// IEEE 754 single precision
    Real32 = 8,
    /// IEEE 754 double precision
    Real64 = 9,
    /// Fixed-size byte field; the registered size includes any padding
    String = 10,
    /// Opaque bytes of a registered size
    Custom = 255,
}

impl DataType {
    /// Wire tag of this type
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Look up a type by its wire tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DataType::Bool),
            2 => Some(DataType::UInt8),
            3 => Some(DataType::UInt16),
            4 => Some(DataType::UInt32),
            5 => Some(DataType::Int16),
            6 => Some(DataType::Int32),
            7 => Some(DataType::Int64),
            8 => Some(DataType::Real32),
            9 => Some(DataType::Real64),
            10 => Some(DataType::String),
            255 => Some(DataType::Custom),
            _ => None,
        }
    }

    /// Size in bytes for fixed-width types
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::UInt8 => Some(1),
            DataType::UInt16 | DataType::Int16 => Some(2),
            DataType::UInt32 | DataType::Int32 | DataType::Real32 => Some(4),
            DataType::Int64 | DataType::Real64 => Some(8),
            DataType::String | DataType::Custom => None,
        }
    }
}

/// Frame header (20 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Wire format version, currently always 1
    pub version: u8,
    /// How the body is laid out
    pub payload_type: PayloadType,
    /// Variables in the frame; zero is allowed for Batch frames
    pub var_count: u16,
    /// Exact serialized length of the whole frame
    pub total_size: u32,
    /// Capture time in microseconds
    pub timestamp_us: u64,
    /// Producer-local sequence number for loss detection
    pub sequence: u32,
}

impl FrameHeader {
    /// Encode into the wire layout
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.payload_type as u8;
        out[2..4].copy_from_slice(&self.var_count.to_le_bytes());
        out[4..8].copy_from_slice(&self.total_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.timestamp_us.to_le_bytes());
        out[16..20].copy_from_slice(&self.sequence.to_le_bytes());
        out
    }

    /// Parse the first 20 bytes without semantic validation
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: &[u8; FRAME_HEADER_SIZE] = bytes
            .get(..FRAME_HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::HeaderTooShort(bytes.len()))?;

        Ok(Self {
            version: raw[0],
            payload_type: PayloadType::try_from(raw[1])?,
            var_count: u16::from_le_bytes([raw[2], raw[3]]),
            total_size: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            timestamp_us: u64::from_le_bytes([
                raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
            ]),
            sequence: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
        })
    }

    /// Rewrite payload type and total size of an encoded header in place
    pub(crate) fn patch(frame: &mut [u8], payload_type: PayloadType, total_size: u32) {
        frame[TYPE_OFFSET] = payload_type as u8;
        frame[TOTAL_SIZE_OFFSET..TOTAL_SIZE_OFFSET + 4].copy_from_slice(&total_size.to_le_bytes());
    }
}

/// Per-variable header (15 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarHeader {
    pub name_len: u16,
    pub data_type: DataType,
    pub data_len: u32,
    pub timestamp_us: u64,
}

impl VarHeader {
    /// Encode into the wire layout
    pub fn encode(&self) -> [u8; VAR_HEADER_SIZE] {
        let mut out = [0u8; VAR_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.name_len.to_le_bytes());
        out[2] = self.data_type.tag();
        out[3..7].copy_from_slice(&self.data_len.to_le_bytes());
        out[7..15].copy_from_slice(&self.timestamp_us.to_le_bytes());
        out
    }

    /// Parse the first 15 bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: &[u8; VAR_HEADER_SIZE] = bytes
            .get(..VAR_HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::Truncated {
                expected: VAR_HEADER_SIZE,
                actual: bytes.len(),
            })?;

        let data_type = DataType::from_tag(raw[2]).ok_or(ProtocolError::UnknownDataType(raw[2]))?;

        Ok(Self {
            name_len: u16::from_le_bytes([raw[0], raw[1]]),
            data_type,
            data_len: u32::from_le_bytes([raw[3], raw[4], raw[5], raw[6]]),
            timestamp_us: u64::from_le_bytes([
                raw[7], raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14],
            ]),
        })
    }
}
