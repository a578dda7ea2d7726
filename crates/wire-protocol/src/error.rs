//! Protocol Error Types

use payload_compression::CompressionError;
use thiserror::Error;

/// Errors while building or decoding frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than a frame header
    #[error("Frame header needs 20 bytes, got {0}")]
    HeaderTooShort(usize),

    /// Version byte is not the supported version
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Declared total size is smaller than the header
    #[error("Declared frame size {0} is smaller than the header")]
    InvalidTotalSize(u32),

    /// Payload type byte is not Single, Batch or Compressed
    #[error("Unknown payload type {0}")]
    UnknownPayloadType(u8),

    /// Variable type tag is not a known data type
    #[error("Unknown data type tag {0}")]
    UnknownDataType(u8),

    /// Fewer bytes available than the frame declares
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Variable name is not valid UTF-8
    #[error("Variable name is not valid UTF-8")]
    InvalidName,

    /// Parsed variable count disagrees with the header
    #[error("Header declares {declared} variables, body holds {actual}")]
    VariableCountMismatch { declared: u16, actual: usize },

    /// Compressed frames must go through `decompress_frame` first
    #[error("Frame is compressed")]
    CompressedFrame,

    /// Compressed frame ends before its codec id byte
    #[error("Compressed frame is missing its codec id")]
    MissingCodecId,

    /// Codec id could not be interpreted
    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Name longer than a u16 length field allows
    #[error("Variable name too long: {0} bytes")]
    NameTooLong(usize),

    /// Value longer than a u32 length field allows
    #[error("Variable value too large: {0} bytes")]
    ValueTooLarge(usize),

    /// More variables than a u16 count allows
    #[error("Too many variables for one frame: {0}")]
    TooManyVariables(usize),

    /// Frame longer than a u32 size field allows
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}
