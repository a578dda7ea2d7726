//! Dictionary Codec
//!
//! LZ77-style sliding window encoder. Token layout:
//!
//! ```text
//! literal  0vvvvvvv                              (byte < 0x80)
//! match    1000oooo oooooooo 0000llll            (offset 1..=4095, len-3)
//! escaped  10000000 00000000 vvvvvvvv            (offset 0 = raw byte >= 0x80)
//! ```

use crate::{Codec, CodecId};

/// Backward reach of the match finder
const WINDOW_SIZE: usize = 4096;
/// Largest offset a 12-bit field can carry
const MAX_OFFSET: usize = WINDOW_SIZE - 1;
/// Shortest match worth a 3-byte token
const MIN_MATCH: usize = 3;
/// Longest match a 4-bit length field can carry
const MAX_MATCH: usize = 18;
/// Set on every match or escaped-literal token
const MATCH_FLAG: u8 = 0x80;

/// Sliding-window dictionary encoder/decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct DictionaryCodec;

impl DictionaryCodec {
    /// Find the longest match for `input[pos..]` inside the window
    ///
    /// Returns `(offset, length)`. Candidates are scanned from the nearest
    /// position backwards and only strictly longer matches replace the best
    /// one, so equal lengths resolve to the smallest offset.
    pub fn find_match(input: &[u8], pos: usize) -> Option<(usize, usize)> {
        let window_start = pos.saturating_sub(MAX_OFFSET);
        let max_len = MAX_MATCH.min(input.len() - pos);
        if max_len < MIN_MATCH {
            return None;
        }

        let mut best: Option<(usize, usize)> = None;
        for candidate in (window_start..pos).rev() {
            let len = (0..max_len)
                .take_while(|&k| input[candidate + k] == input[pos + k])
                .count();

            if len >= MIN_MATCH && best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((pos - candidate, len));
                if len == max_len {
                    break;
                }
            }
        }

        best
    }
}

impl Codec for DictionaryCodec {
    fn id(&self) -> CodecId {
        CodecId::Dictionary
    }

    fn compress(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());

        let mut pos = 0;
        while pos < input.len() {
            if let Some((offset, len)) = Self::find_match(input, pos) {
                out.extend_from_slice(&[
                    MATCH_FLAG | ((offset >> 8) as u8 & 0x0F),
                    (offset & 0xFF) as u8,
                    (len - MIN_MATCH) as u8 & 0x0F,
                ]);
                pos += len;
                continue;
            }

            let byte = input[pos];
            if byte & MATCH_FLAG == 0 {
                out.push(byte);
            } else {
                out.extend_from_slice(&[MATCH_FLAG, 0x00, byte]);
            }
            pos += 1;
        }

        out
    }

    fn decompress(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() * 2);

        let mut i = 0;
        while i < input.len() {
            let token = input[i];
            if token & MATCH_FLAG == 0 {
                out.push(token);
                i += 1;
                continue;
            }

            // Truncated token
            let Some(&[low, third]) = input.get(i + 1..i + 3) else {
                break;
            };

            let offset = ((token & 0x0F) as usize) << 8 | low as usize;
            if offset == 0 {
                out.push(third);
            } else {
                // Reference before the start of output
                if offset > out.len() {
                    break;
                }
                let start = out.len() - offset;
                let len = (third & 0x0F) as usize + MIN_MATCH;
                // Byte-wise so overlapping references replicate correctly
                for k in 0..len {
                    let byte = out[start + k];
                    out.push(byte);
                }
            }
            i += 3;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_pattern() {
        let input = b"abcabcabcabcabcabc".to_vec();
        let compressed = DictionaryCodec.compress(&input);
        // "abc" literals followed by one overlapping match of 15
        assert_eq!(compressed, vec![b'a', b'b', b'c', 0x80, 3, 12]);
        assert_eq!(DictionaryCodec.decompress(&compressed), input);
    }

    #[test]
    fn test_tie_prefers_nearest_match() {
        // "xyz" appears at 0 and 4; both give a 3-byte match for pos 8
        let input = b"xyz-xyz-xyz".to_vec();
        assert_eq!(DictionaryCodec::find_match(&input, 8), Some((4, 3)));
    }

    #[test]
    fn test_high_bytes_round_trip() {
        let input: Vec<u8> = (0..=255u8).collect();
        let compressed = DictionaryCodec.compress(&input);
        assert_eq!(DictionaryCodec.decompress(&compressed), input);
    }

    #[test]
    fn test_offset_limited_to_window() {
        let mut input = vec![0x11, 0x22, 0x33];
        input.extend((0..MAX_OFFSET).map(|i| (i % 100) as u8 + 0x40));
        input.extend_from_slice(&[0x11, 0x22, 0x33]);
        let compressed = DictionaryCodec.compress(&input);
        assert_eq!(DictionaryCodec.decompress(&compressed), input);
    }

    #[test]
    fn test_truncated_match_token_stops() {
        let decoded = DictionaryCodec.decompress(&[b'a', b'b', b'c', 0x80, 3]);
        assert_eq!(decoded, b"abc".to_vec());
    }

    #[test]
    fn test_offset_past_start_stops() {
        let decoded = DictionaryCodec.decompress(&[b'a', 0x80, 9, 0, b'b']);
        assert_eq!(decoded, b"a".to_vec());
    }
}
