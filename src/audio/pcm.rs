//! # PCM Codec
//!
//! Conversions between the wire format (16-bit signed little-endian PCM), the
//! integer sample domain and normalized floating point samples.
//!
//! ## Formats:
//! - **Wire**: raw bytes, two per sample, little-endian
//! - **PCM16**: `i16` samples in [-32768, 32767]
//! - **Normalized**: `f32` samples in [-1.0, 1.0]
//!
//! Text frames carry the same wire bytes base64 encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Scale between the PCM16 and normalized domains.
pub const PCM16_SCALE: f32 = 32768.0;

/// Errors raised while decoding client or upstream audio payloads.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("audio payload is empty")]
    Empty,

    #[error("audio payload length {0} is not a whole number of 16-bit samples")]
    OddLength(usize),

    #[error("audio payload is not valid base64: {0}")]
    Base64(String),
}

/// Decode little-endian PCM16 bytes into samples.
///
/// ## Errors:
/// - **Empty**: nothing to decode
/// - **OddLength**: a trailing half sample means the frame was cut or corrupted
pub fn decode_le_bytes(data: &[u8]) -> Result<Vec<i16>, CodecError> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }
    if data.len() % 2 != 0 {
        return Err(CodecError::OddLength(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode samples as little-endian PCM16 bytes.
pub fn encode_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Scale PCM16 samples into the normalized [-1.0, 1.0) range.
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| sample as f32 / PCM16_SCALE)
        .collect()
}

/// Quantize normalized samples to PCM16.
///
/// Input is clamped to [-1.0, 1.0] first and rounded to the nearest step, so the
/// round trip through [`pcm16_to_f32`] stays within one quantization step.
/// `+1.0` saturates at `i16::MAX`.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let scaled = (sample.clamp(-1.0, 1.0) * PCM16_SCALE).round();
            scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

/// Decode a base64 audio payload from a JSON text frame into wire bytes.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, CodecError> {
    BASE64
        .decode(payload.trim())
        .map_err(|err| CodecError::Base64(err.to_string()))
}

/// Encode wire bytes as base64 (the upstream protocol carries audio this way).
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_one_step() {
        let step = 1.0 / PCM16_SCALE;
        let inputs: Vec<f32> = (-1000..=1000).map(|i| i as f32 / 1000.0).collect();

        let restored = pcm16_to_f32(&f32_to_pcm16(&inputs));

        for (original, back) in inputs.iter().zip(restored.iter()) {
            let diff = (original - back).abs();
            assert!(
                diff <= step + f32::EPSILON,
                "round trip error too large: {} -> {} ({})",
                original,
                back,
                diff
            );
        }
    }

    #[test]
    fn test_out_of_range_input_is_clamped() {
        let pcm = f32_to_pcm16(&[1.5, -3.0, 1.0, -1.0]);
        assert_eq!(pcm, vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_decode_little_endian() {
        let bytes = [0x01, 0x00, 0xff, 0x7f, 0x00, 0x80];
        let samples = decode_le_bytes(&bytes).unwrap();
        assert_eq!(samples, vec![1, i16::MAX, i16::MIN]);
        assert_eq!(encode_le_bytes(&samples), bytes.to_vec());
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        assert_eq!(decode_le_bytes(&[]), Err(CodecError::Empty));
        assert_eq!(decode_le_bytes(&[0, 1, 2]), Err(CodecError::OddLength(3)));
    }

    #[test]
    fn test_base64_payloads() {
        let bytes = encode_le_bytes(&[100, -100, 0]);
        let encoded = encode_base64(&bytes);
        assert_eq!(decode_base64(&encoded).unwrap(), bytes);
        assert!(matches!(
            decode_base64("not base64!"),
            Err(CodecError::Base64(_))
        ));
    }
}
