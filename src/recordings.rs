//! # Recording Store
//!
//! Finished session recordings, kept in memory so clients can download the
//! WAV after a conversation ends. The store is bounded: once it holds
//! `capacity` recordings, adding a new one evicts the oldest.

use crate::audio::mixer::Mixdown;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A session's mixed-down conversation.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub session_id: String,
    pub sample_rate: u32,
    pub sample_count: usize,
    pub created_at: DateTime<Utc>,
    pub wav: Arc<Vec<u8>>,
}

impl RecordingArtifact {
    pub fn from_mixdown(session_id: &str, mixdown: Mixdown) -> Self {
        Self {
            session_id: session_id.to_string(),
            sample_rate: mixdown.sample_rate,
            sample_count: mixdown.samples.len(),
            created_at: Utc::now(),
            wav: Arc::new(mixdown.wav),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count as f64 / self.sample_rate as f64
    }

    /// Download path for this recording.
    pub fn url(&self) -> String {
        format!("/api/v1/recordings/{}", self.session_id)
    }

    pub fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            sample_rate: self.sample_rate,
            duration_seconds: self.duration_seconds(),
            size_bytes: self.wav.len(),
            url: self.url(),
        }
    }
}

/// Listing entry for a stored recording (no audio payload).
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub duration_seconds: f64,
    pub size_bytes: usize,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RecordingStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Debug)]
struct StoreInner {
    capacity: usize,
    recordings: VecDeque<RecordingArtifact>,
}

impl RecordingStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                capacity: capacity.max(1),
                recordings: VecDeque::new(),
            })),
        }
    }

    pub fn insert(&self, artifact: RecordingArtifact) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .recordings
            .retain(|existing| existing.session_id != artifact.session_id);
        inner.recordings.push_back(artifact);
        Self::evict(&mut inner);
    }

    pub fn get(&self, session_id: &str) -> Option<RecordingArtifact> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .recordings
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned()
    }

    /// Summaries, newest first.
    pub fn list(&self) -> Vec<RecordingSummary> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.recordings.iter().rev().map(RecordingArtifact::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .recordings
            .len()
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.capacity = capacity.max(1);
        Self::evict(&mut inner);
    }

    fn evict(inner: &mut StoreInner) {
        while inner.recordings.len() > inner.capacity {
            if let Some(old) = inner.recordings.pop_front() {
                debug!(session_id = %old.session_id, "Evicted stored recording");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(id: &str, samples: usize) -> RecordingArtifact {
        RecordingArtifact::from_mixdown(
            id,
            Mixdown {
                samples: vec![0.0; samples],
                sample_rate: 24_000,
                wav: vec![0; 44 + samples * 2],
            },
        )
    }

    #[test]
    fn test_evicts_oldest() {
        let store = RecordingStore::new(2);
        store.insert(artifact("a", 10));
        store.insert(artifact("b", 10));
        store.insert(artifact("c", 10));

        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
        let ids: Vec<String> = store.list().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_shrinking_capacity_evicts() {
        let store = RecordingStore::new(5);
        for id in ["a", "b", "c"] {
            store.insert(artifact(id, 1));
        }
        store.set_capacity(1);
        assert_eq!(store.len(), 1);
        assert!(store.get("c").is_some());
    }

    #[test]
    fn test_summary() {
        let summary = artifact("s1", 48_000).summary();
        assert_eq!(summary.url, "/api/v1/recordings/s1");
        assert!((summary.duration_seconds - 2.0).abs() < 1e-9);
        assert_eq!(summary.size_bytes, 44 + 96_000);
    }
}
