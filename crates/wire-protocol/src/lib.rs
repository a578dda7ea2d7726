//! Binary Wire Protocol
//!
//! This crate encodes named variable samples into self-describing binary
//! frames: a fixed 20-byte frame header followed by one variable header,
//! name and value per sample. Frames may be compressed after the header
//! using the codecs from `payload-compression`.
//!
//! ```text
//! FrameHeader  version:u8 type:u8 var_count:u16 total_size:u32 ts_us:u64 seq:u32
//! VarHeader    name_len:u16 type_tag:u8 data_len:u32 ts_us:u64
//! ```
//!
//! All integers are little-endian and the layout is packed.

mod builder;
mod compressed;
mod decode;
mod error;
mod header;

pub use builder::{FrameBuilder, FrameEncoder, Variable};
pub use compressed::{
    decompress_frame, CompressedFrameBuilder, BATCH_COMPRESS_THRESHOLD,
    SINGLE_COMPRESS_THRESHOLD,
};
pub use decode::{decode_frame, decode_header, DecodedFrame, DecodedVariable};
pub use error::ProtocolError;
pub use header::{DataType, FrameHeader, PayloadType, VarHeader};

/// The only protocol version this crate reads and writes
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded size of [`FrameHeader`]
pub const FRAME_HEADER_SIZE: usize = 20;

/// Encoded size of [`VarHeader`]
pub const VAR_HEADER_SIZE: usize = 15;

/// Current wall-clock time in microseconds since the Unix epoch
pub fn timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
