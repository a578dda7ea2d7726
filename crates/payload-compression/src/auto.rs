//! Automatic Codec Selection

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{
    Codec, CodecId, CompressionError, DictionaryCodec, RunLengthCodec, MIN_COMPRESS_LEN,
};

/// Result of an automatic compression attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    /// Codec that produced `bytes` (`None` means `bytes` is the input)
    pub codec: CodecId,
    /// Codec output
    pub bytes: Vec<u8>,
}

impl Compressed {
    fn identity(input: &[u8]) -> Self {
        Self {
            codec: CodecId::None,
            bytes: input.to_vec(),
        }
    }
}

/// Outcome of [`PayloadCompressor::benchmark`]
#[derive(Debug, Clone, Serialize)]
pub struct CompressionStats {
    pub original_size: usize,
    pub compressed_size: usize,
    /// original / compressed (1.0 for empty input)
    pub ratio: f64,
    pub elapsed: Duration,
    pub codec: CodecId,
}

impl CompressionStats {
    /// Bytes saved (zero when nothing was compressed)
    pub fn savings(&self) -> usize {
        self.original_size.saturating_sub(self.compressed_size)
    }
}

/// Runs both codecs and keeps the better result
pub struct PayloadCompressor;

impl PayloadCompressor {
    /// Compress with whichever codec yields the smaller output
    ///
    /// Inputs under 64 bytes are returned unchanged. A codec result is only
    /// kept if it is below 90% of the input size.
    pub fn compress_auto(input: &[u8]) -> Compressed {
        if input.len() < MIN_COMPRESS_LEN {
            return Compressed::identity(input);
        }

        let rle = RunLengthCodec.compress(input);
        let dict = DictionaryCodec.compress(input);

        if rle.len() < dict.len() && Self::pays_off(rle.len(), input.len()) {
            Compressed {
                codec: CodecId::RunLength,
                bytes: rle,
            }
        } else if Self::pays_off(dict.len(), input.len()) {
            Compressed {
                codec: CodecId::Dictionary,
                bytes: dict,
            }
        } else {
            Compressed::identity(input)
        }
    }

    /// Decompress bytes produced by `codec`
    pub fn decompress(input: &[u8], codec: CodecId) -> Vec<u8> {
        match codec {
            CodecId::RunLength => RunLengthCodec.decompress(input),
            CodecId::Dictionary => DictionaryCodec.decompress(input),
            CodecId::None => input.to_vec(),
        }
    }

    /// Decompress using a raw codec id byte from the wire
    pub fn decompress_with_id(input: &[u8], codec_id: u8) -> Result<Vec<u8>, CompressionError> {
        let codec = CodecId::try_from(codec_id)?;
        Ok(Self::decompress(input, codec))
    }

    /// Time one automatic compression of `input`
    pub fn benchmark(input: &[u8]) -> CompressionStats {
        let start = Instant::now();
        let compressed = Self::compress_auto(input);
        let elapsed = start.elapsed();

        let ratio = if input.is_empty() || compressed.bytes.is_empty() {
            1.0
        } else {
            input.len() as f64 / compressed.bytes.len() as f64
        };

        CompressionStats {
            original_size: input.len(),
            compressed_size: compressed.bytes.len(),
            ratio,
            elapsed,
            codec: compressed.codec,
        }
    }

    /// `size < 0.9 * original`, in integer arithmetic
    pub(crate) fn pays_off(size: usize, original: usize) -> bool {
        size * 10 < original * 9
    }
}
