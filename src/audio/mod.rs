//! # Audio Pipeline
//!
//! Everything the relay does to audio samples, independent of any transport.
//!
//! ## Key Components:
//! - **Frame**: one chunk of PCM16 mono audio tagged with its source and order
//! - **PCM**: wire decoding/encoding and normalization
//! - **Playback**: gapless scheduling of agent audio and atomic flush
//! - **Barge-in**: RMS-based interruption detection on user audio
//! - **Mixer / WAV**: end-of-session mixdown into a downloadable recording
//!
//! ## Audio Format:
//! - **Sample Rate**: 24kHz by default (configurable)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono
//! - **Encoding**: Little-endian signed integers

pub mod barge_in; // Interruption detection
pub mod frame; // Audio frame type
pub mod mixer; // Recording buffer and mixdown
pub mod pcm; // Sample format conversions
pub mod playback; // Output clock and playback scheduler
pub mod wav; // WAV container encoding
