//! # Audio Frames
//!
//! The unit of audio that flows through a relay session. A frame is one chunk of
//! PCM16 mono samples as it arrived from either side of the conversation, tagged
//! with where it came from and its position in that side's arrival order.

use crate::audio::pcm;
use serde::Serialize;
use std::time::Duration;

/// Sample rate of the relay protocol (PCM16, mono, 24 kHz).
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Which side of the conversation produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSource {
    /// Microphone audio captured by the client
    User,
    /// Synthesized voice coming back from upstream
    Agent,
}

/// One captured chunk of PCM16 mono audio.
///
/// Frames are immutable once built; consumers borrow them for analysis and the
/// recording buffer takes ownership at the end of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Side of the conversation this frame belongs to
    pub source: FrameSource,
    /// Arrival order within `source` (starts at 0)
    pub seq: u64,
    /// Samples per second
    pub sample_rate: u32,
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(source: FrameSource, seq: u64, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            source,
            seq,
            sample_rate,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of this frame, computed in whole nanoseconds so that
    /// back-to-back frames add up without floating point drift.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.samples.len() as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Samples scaled to the normalized [-1.0, 1.0] range.
    pub fn normalized(&self) -> Vec<f32> {
        pcm::pcm16_to_f32(&self.samples)
    }
}
