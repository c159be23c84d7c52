//! WAV container encoding for finished recordings.
//!
//! Produces the canonical 44-byte RIFF header (PCM, mono, 16-bit) followed by
//! the little-endian sample data.

use crate::audio::pcm;
use byteorder::{ByteOrder, LittleEndian};

pub const WAV_HEADER_LEN: usize = 44;

const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const BLOCK_ALIGN: u16 = CHANNELS * BITS_PER_SAMPLE / 8;

/// Encode PCM16 mono samples into a complete WAV file.
pub fn encode_pcm16_mono(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * BLOCK_ALIGN as usize) as u32;
    let mut out = vec![0u8; WAV_HEADER_LEN + data_len as usize];

    out[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut out[4..8], 36 + data_len);
    out[8..12].copy_from_slice(b"WAVE");

    out[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut out[16..20], 16);
    LittleEndian::write_u16(&mut out[20..22], 1); // PCM
    LittleEndian::write_u16(&mut out[22..24], CHANNELS);
    LittleEndian::write_u32(&mut out[24..28], sample_rate);
    LittleEndian::write_u32(&mut out[28..32], sample_rate * BLOCK_ALIGN as u32);
    LittleEndian::write_u16(&mut out[32..34], BLOCK_ALIGN);
    LittleEndian::write_u16(&mut out[34..36], BITS_PER_SAMPLE);

    out[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut out[40..44], data_len);
    out[WAV_HEADER_LEN..].copy_from_slice(&pcm::encode_le_bytes(samples));

    out
}

/// Quantize normalized samples and encode them as a WAV file.
pub fn encode_normalized(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    encode_pcm16_mono(&pcm::f32_to_pcm16(samples), sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_fields() {
        for (count, rate) in [(0usize, 24_000u32), (1, 16_000), (480, 24_000), (4_801, 48_000)] {
            let wav = encode_pcm16_mono(&vec![7i16; count], rate);

            assert_eq!(wav.len(), WAV_HEADER_LEN + 2 * count);
            assert_eq!(&wav[0..4], b"RIFF");
            assert_eq!(LittleEndian::read_u32(&wav[4..8]), 36 + 2 * count as u32);
            assert_eq!(&wav[8..16], b"WAVEfmt ");
            assert_eq!(LittleEndian::read_u32(&wav[16..20]), 16);
            assert_eq!(LittleEndian::read_u16(&wav[20..22]), 1);
            assert_eq!(LittleEndian::read_u16(&wav[22..24]), 1);
            assert_eq!(LittleEndian::read_u32(&wav[24..28]), rate);
            assert_eq!(LittleEndian::read_u32(&wav[28..32]), rate * 2);
            assert_eq!(LittleEndian::read_u16(&wav[32..34]), 2);
            assert_eq!(LittleEndian::read_u16(&wav[34..36]), 16);
            assert_eq!(&wav[36..40], b"data");
            assert_eq!(LittleEndian::read_u32(&wav[40..44]), 2 * count as u32);
        }
    }

    #[test]
    fn test_readable_by_wav_decoder() {
        let samples: Vec<i16> = (0..2_400).map(|i| ((i % 200) * 100 - 10_000) as i16).collect();
        let encoded = encode_pcm16_mono(&samples, 24_000);

        let (header, data) = wav::read(&mut Cursor::new(encoded)).unwrap();

        assert_eq!(header.audio_format, 1);
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.sampling_rate, 24_000);
        assert_eq!(header.bits_per_sample, 16);
        match data {
            wav::BitDepth::Sixteen(decoded) => assert_eq!(decoded, samples),
            _ => panic!("expected 16-bit samples"),
        }
    }

    #[test]
    fn test_normalized_samples_are_quantized() {
        let wav = encode_normalized(&[0.5, -0.5, 2.0], 24_000);
        let body = &wav[WAV_HEADER_LEN..];
        assert_eq!(LittleEndian::read_i16(&body[0..2]), 16_384);
        assert_eq!(LittleEndian::read_i16(&body[2..4]), -16_384);
        assert_eq!(LittleEndian::read_i16(&body[4..6]), i16::MAX);
    }
}
