//! # Session Registry
//!
//! Tracks the relay sessions that are currently running so the HTTP surface
//! can list and stop them, and enforces the concurrent session limit.
//!
//! ## Thread Safety:
//! The map sits behind `Arc<RwLock<..>>`; entries are cheap [`SessionHandle`]
//! clones, so the lock is only held for map operations and never across an
//! `.await`.

use crate::relay::error::RelayError;
use crate::relay::protocol::SessionState;
use crate::relay::session::{SessionHandle, SessionInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

/// Aggregate view of all live sessions.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub status_counts: HashMap<String, usize>,
    pub total_interruptions: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail fast when no slot is free, before any upstream work is done.
    pub fn ensure_capacity(&self, limit: usize) -> Result<(), RelayError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        if sessions.len() >= limit {
            return Err(RelayError::SessionLimit(limit));
        }
        Ok(())
    }

    /// Add a started session. Fails if the limit was reached in the meantime.
    pub fn register(&self, handle: SessionHandle, limit: usize) -> Result<(), RelayError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.len() >= limit {
            return Err(RelayError::SessionLimit(limit));
        }
        debug!(session_id = %handle.id(), active = sessions.len() + 1, "Session registered");
        sessions.insert(handle.id().to_string(), handle);
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id).is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<SessionInfo> = sessions.values().map(SessionHandle::info).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Ask every live session to stop (server shutdown).
    pub fn stop_all(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        for handle in sessions.values() {
            handle.request_stop();
        }
        sessions.len()
    }

    pub fn summary(&self, max_sessions: usize) -> RegistrySummary {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());

        let mut status_counts = HashMap::new();
        let mut total_interruptions = 0;
        for handle in sessions.values() {
            let key = if handle.state() == SessionState::Active {
                handle.status().as_str()
            } else {
                "starting_or_closing"
            };
            *status_counts.entry(key.to_string()).or_insert(0) += 1;
            total_interruptions += handle.interruptions();
        }

        RegistrySummary {
            total_sessions: sessions.len(),
            max_sessions,
            status_counts,
            total_interruptions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recordings::RecordingStore;
    use crate::relay::protocol::client_channel;
    use crate::relay::session::{RelayConfig, RelaySession};
    use crate::relay::upstream::{upstream_channel, UpstreamConnector, UpstreamEvent, UpstreamLink};
    use crate::config::AppConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OneShotConnector(Mutex<Option<UpstreamLink>>);

    #[async_trait]
    impl UpstreamConnector for OneShotConnector {
        async fn connect(&self) -> Result<UpstreamLink, RelayError> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| RelayError::Connect("used".to_string()))
        }

        fn describe(&self) -> String {
            "one-shot".to_string()
        }
    }

    async fn live_session() -> (RelaySession, crate::relay::upstream::UpstreamPeer) {
        let (link, _client) = client_channel(8);
        let (upstream, remote) = upstream_channel(8);
        remote
            .events
            .send(UpstreamEvent::SessionReady {
                session_id: "u".to_string(),
            })
            .await
            .unwrap();

        let mut config = RelayConfig::from_app_config(&AppConfig::default());
        config.proactive_greeting = false;
        let connector = OneShotConnector(Mutex::new(Some(upstream)));
        let session = RelaySession::start(link, &connector, config, RecordingStore::new(2))
            .await
            .unwrap();
        (session, remote)
    }

    #[tokio::test]
    async fn test_limit_is_enforced() {
        let registry = SessionRegistry::new();
        let (first, _r1) = live_session().await;
        let (second, _r2) = live_session().await;

        registry.ensure_capacity(1).unwrap();
        registry.register(first.handle(), 1).unwrap();

        assert!(matches!(
            registry.ensure_capacity(1),
            Err(RelayError::SessionLimit(1))
        ));
        assert!(matches!(
            registry.register(second.handle(), 1),
            Err(RelayError::SessionLimit(1))
        ));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(first.id()));
        assert!(!registry.remove(first.id()));
        registry.register(second.handle(), 1).unwrap();
    }

    #[tokio::test]
    async fn test_list_and_summary() {
        let registry = SessionRegistry::new();
        let (session, _remote) = live_session().await;
        registry.register(session.handle(), 10).unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, session.id());
        assert_eq!(listed[0].state, SessionState::Active);

        let summary = registry.summary(10);
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.status_counts.get("ready"), Some(&1));
        assert!(registry.get(session.id()).is_some());
    }
}
