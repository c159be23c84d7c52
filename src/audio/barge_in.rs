//! Energy-based barge-in detection on the user's microphone stream.
//!
//! While the agent is speaking, a user frame whose RMS level crosses the
//! threshold counts as an interruption. Frames arriving in any other status
//! are measured but never interrupt.

use crate::relay::protocol::AgentStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// RMS level above which user speech interrupts the agent.
pub const DEFAULT_RMS_THRESHOLD: f32 = 0.015;

/// Minimum time between two interruptions from the same session.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(250);

/// Root mean square of normalized samples. Empty input is silence.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Latest input level of a session, readable from other tasks.
#[derive(Debug, Clone, Default)]
pub struct LevelMeter(Arc<AtomicU32>);

impl LevelMeter {
    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Outcome of evaluating one user frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub rms: f32,
    pub interrupt: bool,
}

#[derive(Debug)]
pub struct BargeInDetector {
    threshold: f32,
    min_interval: Duration,
    last_interrupt: Option<Instant>,
    meter: LevelMeter,
}

impl BargeInDetector {
    pub fn new(threshold: f32, min_interval: Duration) -> Self {
        Self {
            threshold,
            min_interval,
            last_interrupt: None,
            meter: LevelMeter::default(),
        }
    }

    pub fn meter(&self) -> LevelMeter {
        self.meter.clone()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Measure a frame and decide whether it interrupts the agent.
    pub fn evaluate(&mut self, samples: &[f32], status: AgentStatus, now: Instant) -> Detection {
        let level = rms(samples);
        self.meter.set(level);

        let cooled_down = self
            .last_interrupt
            .map_or(true, |last| now.duration_since(last) >= self.min_interval);
        let interrupt = status == AgentStatus::AgentSpeaking && level > self.threshold && cooled_down;

        if interrupt {
            self.last_interrupt = Some(now);
        }

        Detection {
            rms: level,
            interrupt,
        }
    }
}

impl Default for BargeInDetector {
    fn default() -> Self {
        Self::new(DEFAULT_RMS_THRESHOLD, DEFAULT_MIN_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert!((rms(&[0.3, -0.3, 0.3, -0.3]) - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_only_interrupts_while_agent_speaking() {
        let now = Instant::now();
        let loud = vec![0.05f32; 480];

        for status in [AgentStatus::Listening, AgentStatus::Processing, AgentStatus::Ready] {
            let mut detector = BargeInDetector::default();
            let detection = detector.evaluate(&loud, status, now);
            assert!(!detection.interrupt, "interrupted while {:?}", status);
        }

        let mut detector = BargeInDetector::default();
        assert!(detector.evaluate(&loud, AgentStatus::AgentSpeaking, now).interrupt);
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let now = Instant::now();
        let mut detector = BargeInDetector::new(0.5, Duration::ZERO);

        assert!(!detector.evaluate(&[0.5; 16], AgentStatus::AgentSpeaking, now).interrupt);
        assert!(!detector.evaluate(&[0.0; 16], AgentStatus::AgentSpeaking, now).interrupt);
        assert!(detector.evaluate(&[0.6; 16], AgentStatus::AgentSpeaking, now).interrupt);
    }

    #[tokio::test]
    async fn test_min_interval_between_interruptions() {
        let start = Instant::now();
        let loud = vec![0.2f32; 480];
        let mut detector = BargeInDetector::new(DEFAULT_RMS_THRESHOLD, Duration::from_millis(250));

        assert!(detector.evaluate(&loud, AgentStatus::AgentSpeaking, start).interrupt);
        assert!(!detector
            .evaluate(&loud, AgentStatus::AgentSpeaking, start + Duration::from_millis(100))
            .interrupt);
        assert!(detector
            .evaluate(&loud, AgentStatus::AgentSpeaking, start + Duration::from_millis(300))
            .interrupt);
    }

    #[tokio::test]
    async fn test_meter_tracks_latest_level() {
        let mut detector = BargeInDetector::default();
        let meter = detector.meter();

        detector.evaluate(&[0.25; 32], AgentStatus::Listening, Instant::now());
        assert!((meter.get() - 0.25).abs() < 1e-6);
    }
}
