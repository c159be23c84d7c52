//! # Upstream Interface
//!
//! The relay talks to the realtime voice service through a pair of channels:
//! commands go out, decoded events come back. How those channels are wired to
//! a network connection is the connector's business, which keeps the session
//! logic independent of any particular wire protocol.

use crate::config::AppConfig;
use crate::relay::error::RelayError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Conversation settings sent upstream when a session is configured.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamSessionConfig {
    pub voice: String,
    pub instructions: Option<String>,
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
    /// Input noise suppression model, `None` when disabled
    pub noise_reduction: Option<String>,
    pub echo_cancellation: bool,
}

impl UpstreamSessionConfig {
    /// Build from application config, reading agent instructions from disk when present.
    pub fn from_config(config: &AppConfig) -> Self {
        let instructions = load_instructions(&config.voice.instructions_file);
        Self {
            voice: config.voice.voice_name.clone(),
            instructions,
            vad_threshold: config.voice.vad_threshold,
            vad_prefix_padding_ms: config.voice.vad_prefix_padding_ms,
            vad_silence_duration_ms: config.voice.vad_silence_duration_ms,
            noise_reduction: Some(config.voice.noise_reduction.trim())
                .filter(|model| !model.is_empty())
                .map(str::to_string),
            echo_cancellation: config.voice.echo_cancellation,
        }
    }
}

fn load_instructions(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    if !Path::new(path).exists() {
        debug!(path, "No agent instructions file, using upstream defaults");
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Ok(_) => None,
        Err(err) => {
            warn!(path, error = %err, "Failed to read agent instructions");
            None
        }
    }
}

/// Requests the relay sends upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamCommand {
    /// Apply voice, instructions and turn detection settings
    Configure(UpstreamSessionConfig),
    /// Append raw PCM16 LE user audio to the input buffer
    AppendAudio(Vec<u8>),
    /// Cancel the response currently being generated
    CancelResponse,
    /// Ask the agent to respond now (proactive greeting)
    CreateResponse,
    Close,
}

/// Decoded events from upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Upstream opened a session; configuration not yet applied
    SessionCreated { session_id: String },
    /// Configuration acknowledged, carrying upstream's own session id
    SessionReady { session_id: String },
    /// Raw PCM16 LE agent audio
    AudioDelta(Vec<u8>),
    UserTranscript(String),
    AgentTranscript(String),
    AgentText(String),
    SpeechStarted,
    SpeechStopped,
    ResponseStarted,
    AudioDone,
    ResponseDone,
    Error(String),
}

/// The session's side of an upstream connection.
#[derive(Debug)]
pub struct UpstreamLink {
    pub commands: mpsc::Sender<UpstreamCommand>,
    pub events: mpsc::Receiver<UpstreamEvent>,
}

/// The connection's side of an upstream link.
#[derive(Debug)]
pub struct UpstreamPeer {
    pub commands: mpsc::Receiver<UpstreamCommand>,
    pub events: mpsc::Sender<UpstreamEvent>,
}

/// Create a connected link/peer pair.
pub fn upstream_channel(capacity: usize) -> (UpstreamLink, UpstreamPeer) {
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    (
        UpstreamLink {
            commands: command_tx,
            events: event_rx,
        },
        UpstreamPeer {
            commands: command_rx,
            events: event_tx,
        },
    )
}

/// Opens upstream connections for new sessions.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<UpstreamLink, RelayError>;

    /// Short human-readable description for health output.
    fn describe(&self) -> String;
}

/// Upstream "error" events that only mean a cancel raced a finished response.
pub fn is_benign_error(message: &str) -> bool {
    message.to_lowercase().contains("no active response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_error_filter() {
        assert!(is_benign_error(
            "Cancellation failed: no active response found"
        ));
        assert!(!is_benign_error("Invalid api-key"));
    }

    #[test]
    fn test_audio_cleanup_settings_from_config() {
        let mut config = AppConfig::default();
        config.voice.instructions_file = String::new();

        let settings = UpstreamSessionConfig::from_config(&config);
        assert_eq!(settings.noise_reduction.as_deref(), Some("azure_deep_noise_suppression"));
        assert!(settings.echo_cancellation);

        config.voice.noise_reduction = "  ".to_string();
        config.voice.echo_cancellation = false;
        let settings = UpstreamSessionConfig::from_config(&config);
        assert_eq!(settings.noise_reduction, None);
        assert!(!settings.echo_cancellation);
    }

    #[test]
    fn test_missing_instructions_file() {
        assert_eq!(load_instructions(""), None);
        assert_eq!(load_instructions("definitely/not/here.md"), None);
    }

    #[test]
    fn test_instructions_from_file() {
        let path = std::env::temp_dir().join(format!("voice-relay-{}.md", uuid::Uuid::new_v4()));
        std::fs::write(&path, "  Be brief.\n").unwrap();

        let loaded = load_instructions(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.as_deref(), Some("Be brief."));
    }
}
