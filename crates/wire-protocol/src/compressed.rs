//! Compression-Aware Frame Builder
//!
//! Wraps a [`FrameBuilder`] and compresses everything after the frame
//! header when that is worthwhile. Compressed frames carry a codec id byte
//! right after the header.

use std::borrow::Cow;

use payload_compression::{CodecId, PayloadCompressor};
use tracing::trace;

use crate::builder::{FrameBuilder, FrameEncoder, Variable};
use crate::decode::{decode_header, parse_variables};
use crate::header::{DataType, FrameHeader, PayloadType};
use crate::{ProtocolError, FRAME_HEADER_SIZE};

/// Single frames shorter than this are sent uncompressed
pub const SINGLE_COMPRESS_THRESHOLD: usize = 128;

/// Batch frames shorter than this are sent uncompressed
pub const BATCH_COMPRESS_THRESHOLD: usize = 256;

/// Frame builder that compresses frame bodies
#[derive(Debug)]
pub struct CompressedFrameBuilder {
    inner: FrameBuilder,
    enabled: bool,
}

impl Default for CompressedFrameBuilder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CompressedFrameBuilder {
    /// Create a builder with compression on or off
    pub fn new(enabled: bool) -> Self {
        Self::from_builder(FrameBuilder::new(), enabled)
    }

    /// Wrap an existing builder, keeping its sequence counter
    pub fn from_builder(inner: FrameBuilder, enabled: bool) -> Self {
        Self { inner, enabled }
    }

    /// Build a Single frame, compressed when large and compressible enough
    pub fn build_single(
        &mut self,
        name: &str,
        data_type: DataType,
        value: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.encode_single(&Variable::new(name, data_type, value))
    }

    /// Build a Batch frame, compressed when large and compressible enough
    pub fn build_batch(&mut self, variables: &[Variable<'_>]) -> Result<Vec<u8>, ProtocolError> {
        self.encode_batch(variables)
    }

    /// Turn compression on or off for frames built from now on
    ///
    /// The sequence counter carries on either way.
    pub fn set_compression_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_compression_enabled(&self) -> bool {
        self.enabled
    }

    /// The wrapped uncompressed builder
    pub fn inner(&self) -> &FrameBuilder {
        &self.inner
    }

    fn maybe_compress(&self, frame: Vec<u8>, threshold: usize, require_gain: bool) -> Vec<u8> {
        if !self.enabled || frame.len() < threshold {
            return frame;
        }

        let body = &frame[FRAME_HEADER_SIZE..];
        let compressed = PayloadCompressor::compress_auto(body);

        if compressed.codec == CodecId::None {
            return frame;
        }
        // Batches additionally require a real gain (< 90% of the body)
        if require_gain && compressed.bytes.len() * 10 >= body.len() * 9 {
            return frame;
        }

        let total = FRAME_HEADER_SIZE + 1 + compressed.bytes.len();
        trace!(
            "Compressed frame body {} -> {} bytes ({:?})",
            body.len(),
            compressed.bytes.len(),
            compressed.codec
        );

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&frame[..FRAME_HEADER_SIZE]);
        // Smaller than the uncompressed frame, so it fits in u32
        FrameHeader::patch(&mut out, PayloadType::Compressed, total as u32);
        out.push(compressed.codec.as_u8());
        out.extend_from_slice(&compressed.bytes);
        out
    }
}

impl FrameEncoder for CompressedFrameBuilder {
    fn encode_single(&mut self, variable: &Variable<'_>) -> Result<Vec<u8>, ProtocolError> {
        let frame = self.inner.encode_single(variable)?;
        Ok(self.maybe_compress(frame, SINGLE_COMPRESS_THRESHOLD, false))
    }

    fn encode_batch(&mut self, variables: &[Variable<'_>]) -> Result<Vec<u8>, ProtocolError> {
        let frame = self.inner.encode_batch(variables)?;
        Ok(self.maybe_compress(frame, BATCH_COMPRESS_THRESHOLD, true))
    }

    fn sequence(&self) -> u32 {
        self.inner.sequence()
    }
}

/// Restore an uncompressed frame from a possibly compressed one
///
/// Frames that are not compressed come back unchanged (borrowed). A
/// compressed frame is rebuilt as a Batch frame with `total_size` and
/// `var_count` recomputed from the decompressed body; timestamp and
/// sequence number are kept.
pub fn decompress_frame(bytes: &[u8]) -> Result<Cow<'_, [u8]>, ProtocolError> {
    let header = decode_header(bytes)?;
    if header.payload_type != PayloadType::Compressed {
        return Ok(Cow::Borrowed(bytes));
    }

    let total = header.total_size as usize;
    if bytes.len() < total {
        return Err(ProtocolError::Truncated {
            expected: total,
            actual: bytes.len(),
        });
    }
    if total <= FRAME_HEADER_SIZE {
        return Err(ProtocolError::MissingCodecId);
    }

    let codec = CodecId::try_from(bytes[FRAME_HEADER_SIZE])?;
    let body = PayloadCompressor::decompress(&bytes[FRAME_HEADER_SIZE + 1..total], codec);

    let var_count = parse_variables(&body)?.len();
    let var_count =
        u16::try_from(var_count).map_err(|_| ProtocolError::TooManyVariables(var_count))?;
    let rebuilt_size = FRAME_HEADER_SIZE + body.len();
    let total_size =
        u32::try_from(rebuilt_size).map_err(|_| ProtocolError::FrameTooLarge(rebuilt_size))?;

    let rebuilt = FrameHeader {
        payload_type: PayloadType::Batch,
        var_count,
        total_size,
        ..header
    };

    let mut out = Vec::with_capacity(rebuilt_size);
    out.extend_from_slice(&rebuilt.encode());
    out.extend_from_slice(&body);
    Ok(Cow::Owned(out))
}
