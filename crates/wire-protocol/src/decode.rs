//! Frame Decoding
//!
//! Decoding never interprets a frame partially: either the whole frame
//! parses or an error is returned.

use crate::header::{DataType, FrameHeader, PayloadType, VarHeader};
use crate::{ProtocolError, FRAME_HEADER_SIZE, PROTOCOL_VERSION, VAR_HEADER_SIZE};

/// Borrowed view of one variable inside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedVariable<'a> {
    pub name: &'a str,
    pub data_type: DataType,
    pub timestamp_us: u64,
    pub value: &'a [u8],
}

/// A fully parsed uncompressed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub header: FrameHeader,
    pub variables: Vec<DecodedVariable<'a>>,
}

/// Decode and validate a frame header
///
/// Checks that the version is supported, that the payload type is known and
/// that the declared size covers at least the header. Body validation is
/// left to the caller.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
    let header = FrameHeader::parse(bytes)?;

    if header.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header.version));
    }
    if (header.total_size as usize) < FRAME_HEADER_SIZE {
        return Err(ProtocolError::InvalidTotalSize(header.total_size));
    }

    Ok(header)
}

/// Decode a complete Single or Batch frame
///
/// Bytes beyond `total_size` are ignored. Compressed frames are rejected;
/// pass them through `decompress_frame` first.
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame<'_>, ProtocolError> {
    let header = decode_header(bytes)?;
    if header.payload_type == PayloadType::Compressed {
        return Err(ProtocolError::CompressedFrame);
    }

    let total = header.total_size as usize;
    if bytes.len() < total {
        return Err(ProtocolError::Truncated {
            expected: total,
            actual: bytes.len(),
        });
    }

    let variables = parse_variables(&bytes[FRAME_HEADER_SIZE..total])?;
    if variables.len() != header.var_count as usize {
        return Err(ProtocolError::VariableCountMismatch {
            declared: header.var_count,
            actual: variables.len(),
        });
    }

    Ok(DecodedFrame { header, variables })
}

/// Parse a frame body (everything after the header) into variables
pub(crate) fn parse_variables(body: &[u8]) -> Result<Vec<DecodedVariable<'_>>, ProtocolError> {
    let mut variables = Vec::new();

    let mut rest = body;
    while !rest.is_empty() {
        let var_header = VarHeader::parse(rest)?;
        let name_len = var_header.name_len as usize;
        let data_len = var_header.data_len as usize;

        let needed = VAR_HEADER_SIZE + name_len + data_len;
        if rest.len() < needed {
            return Err(ProtocolError::Truncated {
                expected: needed,
                actual: rest.len(),
            });
        }

        let name_bytes = &rest[VAR_HEADER_SIZE..VAR_HEADER_SIZE + name_len];
        let name = std::str::from_utf8(name_bytes).map_err(|_| ProtocolError::InvalidName)?;
        let value = &rest[VAR_HEADER_SIZE + name_len..needed];

        variables.push(DecodedVariable {
            name,
            data_type: var_header.data_type,
            timestamp_us: var_header.timestamp_us,
            value,
        });
        rest = &rest[needed..];
    }

    Ok(variables)
}
