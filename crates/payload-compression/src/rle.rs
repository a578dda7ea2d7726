//! Run-Length Codec
//!
//! Runs of 3..=255 identical bytes become `[0xFF][len][value]`. Every other
//! byte is copied through, except `0xFF` itself which is escaped as
//! `[0xFF][0x00]`. A run length is never zero, so the byte after a marker
//! tells the decoder unambiguously which form follows.

use crate::{Codec, CodecId, MIN_COMPRESS_LEN};

/// Escape marker introducing a run or an escaped literal
const MARKER: u8 = 0xFF;
/// Shortest run worth encoding
const MIN_RUN: usize = 3;
/// Longest run a single token can describe
const MAX_RUN: usize = 255;
/// Bytes inspected by the repetition heuristic
const SAMPLE_LEN: usize = 100;

/// Run-length encoder/decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct RunLengthCodec;

impl RunLengthCodec {
    /// Quick check whether the input looks repetitive enough to bother
    ///
    /// Counts adjacent equal bytes in the first 100 bytes and reports true
    /// when more than 20% repeat.
    pub fn is_repetitive(input: &[u8]) -> bool {
        if input.len() < MIN_COMPRESS_LEN {
            return false;
        }

        let sample = input.len().min(SAMPLE_LEN);
        let repetitions = input[..sample]
            .windows(2)
            .filter(|pair| pair[0] == pair[1])
            .count();

        repetitions * 100 / sample > 20
    }
}

impl Codec for RunLengthCodec {
    fn id(&self) -> CodecId {
        CodecId::RunLength
    }

    fn compress(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());

        let mut i = 0;
        while i < input.len() {
            let current = input[i];
            let run = input[i..]
                .iter()
                .take(MAX_RUN)
                .take_while(|&&b| b == current)
                .count();

            if run >= MIN_RUN {
                out.extend_from_slice(&[MARKER, run as u8, current]);
                i += run;
            } else {
                if current == MARKER {
                    out.extend_from_slice(&[MARKER, 0x00]);
                } else {
                    out.push(current);
                }
                i += 1;
            }
        }

        out
    }

    fn decompress(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() * 2);

        let mut i = 0;
        while i < input.len() {
            if input[i] != MARKER {
                out.push(input[i]);
                i += 1;
                continue;
            }

            match input.get(i + 1..i + 3) {
                _ if input.get(i + 1) == Some(&0x00) => {
                    out.push(MARKER);
                    i += 2;
                }
                Some(&[count, value]) => {
                    out.resize(out.len() + count as usize, value);
                    i += 3;
                }
                // Truncated run descriptor
                _ => break,
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_encoding() {
        let input = [0, 0, 0, 0, 0, 1, 2, 3];
        let compressed = RunLengthCodec.compress(&input);
        assert_eq!(compressed, vec![0xFF, 5, 0, 1, 2, 3]);
        assert_eq!(RunLengthCodec.decompress(&compressed), input);
    }

    #[test]
    fn test_marker_escaping() {
        let input = [0xFF, 7, 0xFF, 0xFF, 9];
        let compressed = RunLengthCodec.compress(&input);
        assert_eq!(compressed, vec![0xFF, 0x00, 7, 0xFF, 0x00, 0xFF, 0x00, 9]);
        assert_eq!(RunLengthCodec.decompress(&compressed), input);
    }

    #[test]
    fn test_run_of_markers() {
        let input = [0xFF; 4];
        let compressed = RunLengthCodec.compress(&input);
        assert_eq!(compressed, vec![0xFF, 4, 0xFF]);
        assert_eq!(RunLengthCodec.decompress(&compressed), input);
    }

    #[test]
    fn test_long_run_is_split() {
        let input = vec![42u8; 600];
        let compressed = RunLengthCodec.compress(&input);
        // 255 + 255 + 90
        assert_eq!(compressed, vec![0xFF, 255, 42, 0xFF, 255, 42, 0xFF, 90, 42]);
        assert_eq!(RunLengthCodec.decompress(&compressed), input);
    }

    #[test]
    fn test_truncated_descriptor_stops() {
        assert_eq!(RunLengthCodec.decompress(&[1, 2, 0xFF, 5]), vec![1, 2]);
        assert_eq!(RunLengthCodec.decompress(&[1, 0xFF]), vec![1]);
    }

    #[test]
    fn test_repetition_heuristic() {
        assert!(!RunLengthCodec::is_repetitive(&[0u8; 10]));
        assert!(RunLengthCodec::is_repetitive(&[0u8; 200]));

        let varied: Vec<u8> = (0..200).map(|i| (i * 37 % 251) as u8).collect();
        assert!(!RunLengthCodec::is_repetitive(&varied));
    }
}
