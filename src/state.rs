//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket connection.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Many handlers hold a reference to the same data
//! - **RwLock**: Many readers OR one writer at a time
//! - Locks are only held for short, synchronous sections and never across `.await`
//!
//! ### Trait objects
//! The upstream connector is stored as `Arc<dyn UpstreamConnector>`, so the
//! server talks to the realtime service in production while tests can plug in
//! an in-memory fake.

use crate::config::AppConfig;
use crate::recordings::RecordingStore;
use crate::relay::registry::SessionRegistry;
use crate::relay::upstream::UpstreamConnector;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across request handlers.
///
/// Everything inside is either immutable or behind its own lock, so cloning
/// an `AppState` is cheap and every clone sees the same data.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime; running
    /// sessions keep the settings they started with)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Finished session recordings, newest kept
    pub recordings: RecordingStore,

    /// Sessions that are currently relaying audio
    pub sessions: SessionRegistry,

    /// How new sessions reach the voice agent
    pub connector: Arc<dyn UpstreamConnector>,
}

/// Counters collected across HTTP requests and voice sessions.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: reliability of the REST surface
/// - **active_sessions**: current load, compared against the session limit
/// - **total_sessions**: sessions that reached the active state since start
/// - **rejected_sessions**: sessions refused or failed during setup
/// - **total_barge_ins**: how often users interrupted the agent
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub total_sessions: u64,
    pub rejected_sessions: u64,
    pub total_barge_ins: u64,

    /// Key: route pattern (e.g., "GET /api/v1/recordings/{session_id}")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the shared state. The recording store is sized from
    /// `performance.max_stored_recordings`.
    pub fn new(config: AppConfig, connector: Arc<dyn UpstreamConnector>) -> Self {
        let recordings = RecordingStore::new(config.performance.max_stored_recordings);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            recordings,
            sessions: SessionRegistry::new(),
            connector,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// The recording store picks up a new capacity right away; everything
    /// else applies to sessions started afterwards.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.recordings
            .set_capacity(new_config.performance.max_stored_recordings);
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    fn with_metrics(&self, update: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        update(&mut metrics);
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    /// Record one request against an endpoint.
    ///
    /// The first time we see an endpoint, its entry is created with zeros.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let endpoint_metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    /// Called once a session is active and registered.
    pub fn session_started(&self) {
        self.with_metrics(|m| {
            m.active_sessions += 1;
            m.total_sessions += 1;
        });
    }

    /// Called when a registered session has torn down.
    pub fn session_finished(&self, interruptions: u64) {
        self.with_metrics(|m| {
            // Underflow guard: never go below zero
            m.active_sessions = m.active_sessions.saturating_sub(1);
            m.total_barge_ins += interruptions;
        });
    }

    /// Called when a session is refused or fails before becoming active.
    pub fn session_rejected(&self) {
        self.with_metrics(|m| m.rejected_sessions += 1);
    }

    /// Get a consistent copy of the current metrics.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests (0.0 before any request).
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::relay::error::RelayError;
    use crate::relay::upstream::UpstreamLink;
    use async_trait::async_trait;

    /// Connector for state-level tests that never reaches a voice service.
    pub(crate) struct UnreachableConnector;

    #[async_trait]
    impl UpstreamConnector for UnreachableConnector {
        async fn connect(&self) -> Result<UpstreamLink, RelayError> {
            Err(RelayError::Connect("unreachable in tests".to_string()))
        }

        fn describe(&self) -> String {
            "unreachable".to_string()
        }
    }

    pub(crate) fn test_state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(UnreachableConnector))
    }

    #[test]
    fn test_session_counters() {
        let state = test_state();
        state.session_started();
        state.session_started();
        state.session_finished(3);
        state.session_rejected();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.total_sessions, 2);
        assert_eq!(metrics.total_barge_ins, 3);
        assert_eq!(metrics.rejected_sessions, 1);

        state.session_finished(0);
        state.session_finished(0);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
        assert_eq!(EndpointMetric::default().error_rate(), 0.0);
    }

    #[test]
    fn test_update_config_validates() {
        let state = test_state();

        let mut invalid = state.get_config();
        invalid.server.port = 0;
        assert!(state.update_config(invalid).is_err());
        assert_eq!(state.get_config().server.port, 8000);

        let mut valid = state.get_config();
        valid.performance.max_stored_recordings = 3;
        state.update_config(valid).unwrap();
        assert_eq!(state.get_config().performance.max_stored_recordings, 3);
    }
}
