//! Payload Compression
//!
//! Lossless byte-stream codecs for variable-value payloads:
//! - Run-length encoding for long runs of identical bytes
//! - Dictionary (sliding window) encoding for repeated byte sequences
//! - Automatic selection that only keeps a result when it pays off

mod auto;
mod dictionary;
mod error;
mod rle;

pub use auto::{Compressed, CompressionStats, PayloadCompressor};
pub use dictionary::DictionaryCodec;
pub use error::CompressionError;
pub use rle::RunLengthCodec;

use serde::{Deserialize, Serialize};

/// Inputs shorter than this are never compressed
pub const MIN_COMPRESS_LEN: usize = 64;

/// Codec identifier carried on the wire after a compressed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodecId {
    /// Payload stored as-is
    None = 0,
    /// Run-length encoding
    RunLength = 1,
    /// Sliding-window dictionary encoding
    Dictionary = 2,
}

impl CodecId {
    /// Wire value of this codec
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for CodecId {
    type Error = CompressionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CodecId::None),
            1 => Ok(CodecId::RunLength),
            2 => Ok(CodecId::Dictionary),
            other => Err(CompressionError::UnknownCodec(other)),
        }
    }
}

/// A compress/decompress pair identified by a [`CodecId`]
pub trait Codec {
    /// Identifier written next to this codec's output
    fn id(&self) -> CodecId;

    /// Compress `input`. Never fails; the output may be larger than the input.
    fn compress(&self, input: &[u8]) -> Vec<u8>;

    /// Decompress `input`. Malformed trailing tokens end decoding early.
    fn decompress(&self, input: &[u8]) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_id_conversion() {
        assert_eq!(CodecId::try_from(0).unwrap(), CodecId::None);
        assert_eq!(CodecId::try_from(1).unwrap(), CodecId::RunLength);
        assert_eq!(CodecId::try_from(2).unwrap(), CodecId::Dictionary);
        assert!(matches!(
            CodecId::try_from(7),
            Err(CompressionError::UnknownCodec(7))
        ));
        assert_eq!(CodecId::Dictionary.as_u8(), 2);
    }
}
