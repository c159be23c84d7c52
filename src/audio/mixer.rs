//! # Recording Mixer
//!
//! Collects both sides of a conversation while a session runs and folds them
//! into one mono track when it ends.
//!
//! ## Mixing rules:
//! - Each side is concatenated in arrival order
//! - Both tracks start at sample 0; the shorter one is padded with silence
//! - Samples are summed and hard-clamped to [-1.0, 1.0]
//!
//! Tracks are aligned at index 0 rather than by wall-clock arrival time, so
//! pauses between turns are not reproduced in the mixdown.

use crate::audio::frame::AudioFrame;
use crate::audio::wav;

/// One side of the conversation, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingTrack {
    frames: Vec<AudioFrame>,
    samples: usize,
}

impl RecordingTrack {
    pub fn push(&mut self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }
        self.samples += frame.len();
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }
}

/// Both tracks of a session. Drained at most once, at teardown.
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    pub user: RecordingTrack,
    pub agent: RecordingTrack,
    drained: bool,
}

impl RecordingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand both tracks over for mixing. Returns `None` once already drained.
    pub fn take(&mut self) -> Option<(RecordingTrack, RecordingTrack)> {
        if self.drained {
            return None;
        }
        self.drained = true;
        Some((
            std::mem::take(&mut self.user),
            std::mem::take(&mut self.agent),
        ))
    }
}

/// Result of mixing a session down to one track.
#[derive(Debug, Clone)]
pub struct Mixdown {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub wav: Vec<u8>,
}

/// Concatenate frames into one normalized track.
pub fn concat(frames: &[AudioFrame]) -> Vec<f32> {
    let total = frames.iter().map(AudioFrame::len).sum();
    let mut track = Vec::with_capacity(total);
    for frame in frames {
        track.extend(frame.normalized());
    }
    track
}

/// Sum two tracks sample by sample, padding the shorter one with silence.
pub fn mix(user: &[f32], agent: &[f32]) -> Vec<f32> {
    let len = user.len().max(agent.len());
    (0..len)
        .map(|i| {
            let a = user.get(i).copied().unwrap_or(0.0);
            let b = agent.get(i).copied().unwrap_or(0.0);
            (a + b).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Mix both tracks and encode the result as WAV.
pub fn mixdown(user: &RecordingTrack, agent: &RecordingTrack, sample_rate: u32) -> Mixdown {
    let samples = mix(&concat(user.frames()), &concat(agent.frames()));
    let wav = wav::encode_normalized(&samples, sample_rate);
    Mixdown {
        samples,
        sample_rate,
        wav,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::FrameSource;

    fn frame(source: FrameSource, seq: u64, samples: Vec<i16>) -> AudioFrame {
        AudioFrame::new(source, seq, 24_000, samples)
    }

    #[test]
    fn test_mix_pads_shorter_track() {
        let mixed = mix(&[0.25, 0.25, 0.25], &[0.5]);
        assert_eq!(mixed, vec![0.75, 0.25, 0.25]);

        let mixed = mix(&[], &[0.1, -0.1]);
        assert_eq!(mixed, vec![0.1, -0.1]);
    }

    #[test]
    fn test_mix_clamps() {
        let mixed = mix(&[0.9, -0.9], &[0.9, -0.9]);
        assert_eq!(mixed, vec![1.0, -1.0]);
    }

    #[test]
    fn test_concat_keeps_arrival_order() {
        let frames = vec![
            frame(FrameSource::User, 0, vec![16_384]),
            frame(FrameSource::User, 1, vec![-16_384, 0]),
        ];
        assert_eq!(concat(&frames), vec![0.5, -0.5, 0.0]);
    }

    #[test]
    fn test_buffer_drains_once() {
        let mut buffer = RecordingBuffer::new();
        buffer.user.push(frame(FrameSource::User, 0, vec![1; 10]));
        buffer.agent.push(frame(FrameSource::Agent, 0, vec![1; 30]));
        buffer.user.push(frame(FrameSource::User, 1, Vec::new()));
        assert_eq!(buffer.user.sample_count(), 10);
        assert_eq!(buffer.user.frames().len(), 1);

        let (user, agent) = buffer.take().unwrap();
        assert!(buffer.take().is_none());

        let result = mixdown(&user, &agent, 24_000);
        assert_eq!(result.samples.len(), 30);
        assert_eq!(result.wav.len(), wav::WAV_HEADER_LEN + 60);
        assert_eq!(result.sample_rate, 24_000);
    }
}
