//! Compression Error Types

use thiserror::Error;

/// Errors raised when interpreting compressed data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompressionError {
    /// Codec id byte does not name a known codec
    #[error("Unknown codec id: {0}")]
    UnknownCodec(u8),
}
