//! # Configuration Management
//!
//! This module handles loading and managing the relay's configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, plus the Azure deployment variables)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: converts between these structs and TOML/JSON/environment values
//! - **#[serde(default)]**: lets a config file mention only the fields it changes
//! - **Result<T, E>**: every loading step can fail, and `?` passes the failure up
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (`HOST`, `PORT`, `AZURE_OPENAI_ENDPOINT`, ...)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__SAMPLE_RATE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use crate::audio::frame::DEFAULT_SAMPLE_RATE;
use crate::audio::playback::DEFAULT_SAFETY_MARGIN;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket server listens
/// - **upstream**: which realtime deployment to talk to and how
/// - **voice**: conversation behaviour (voice, turn detection, greeting)
/// - **audio**: sample format, playback timing and barge-in sensitivity
/// - **performance**: resource limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub voice: VoiceConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any address (containers, production)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Upstream realtime service connection settings.
///
/// ## Fields:
/// - `endpoint`: Azure OpenAI resource URL (`https://<name>.openai.azure.com`)
/// - `api_key`: resource key, sent as the `api-key` header
/// - `deployment`: realtime model deployment name
/// - `api_version`: realtime API version query parameter
/// - `connect_timeout_ms`: budget for connecting plus the configuration handshake
///
/// The key never leaves the process: HTTP config responses go through
/// [`AppConfig::redacted`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            deployment: "gpt-realtime".to_string(),
            api_version: "2025-10-01".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// Conversation behaviour sent upstream when a session is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub voice_name: String,
    /// Server-side VAD activation threshold (0.0 - 1.0)
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
    /// Markdown file with agent instructions; optional on disk
    pub instructions_file: String,
    /// Ask the agent to speak first once the session is ready
    pub enable_proactive_greeting: bool,
    /// Upstream input noise suppression model; empty turns it off
    pub noise_reduction: String,
    /// Let upstream cancel the agent's own voice picked up by the microphone
    pub echo_cancellation: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_name: "alloy".to_string(),
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
            instructions_file: "agent_instructions.md".to_string(),
            enable_proactive_greeting: true,
            noise_reduction: "azure_deep_noise_suppression".to_string(),
            echo_cancellation: true,
        }
    }
}

/// Audio handling inside the relay.
///
/// ## Tuning guidelines:
/// - A larger `playback_safety_margin_ms` absorbs more network jitter at the
///   cost of added latency before the first agent sample
/// - A lower `barge_in_rms_threshold` makes interruption more sensitive, and
///   more prone to triggering on background noise
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub playback_safety_margin_ms: u64,
    pub barge_in_rms_threshold: f32,
    pub barge_in_min_interval_ms: u64,
    /// Frames buffered per direction between the WebSocket and the session
    pub client_channel_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            playback_safety_margin_ms: DEFAULT_SAFETY_MARGIN.as_millis() as u64,
            barge_in_rms_threshold: 0.015,
            barge_in_min_interval_ms: 250,
            client_channel_capacity: 256,
        }
    }
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub max_stored_recordings: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            max_stored_recordings: 50,
        }
    }
}

/// Deployment variables that map straight onto config keys.
const DEPLOYMENT_OVERRIDES: [(&str, &str); 7] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("AZURE_OPENAI_ENDPOINT", "upstream.endpoint"),
    ("AZURE_OPENAI_KEY", "upstream.api_key"),
    ("AZURE_OPENAI_DEPLOYMENT", "upstream.deployment"),
    ("AZURE_API_VERSION", "upstream.api_version"),
    ("VOICE_NAME", "voice.voice_name"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Override with the deployment variables (`HOST`, `AZURE_OPENAI_KEY`, ...)
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: nested keys are separated by a double underscore,
    ///   since field names themselves contain single underscores
    /// - `APP_AUDIO__BARGE_IN_RMS_THRESHOLD=0.02`
    /// - `AZURE_OPENAI_ENDPOINT=https://example.openai.azure.com`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (variable, key) in DEPLOYMENT_OVERRIDES {
            if let Ok(value) = env::var(variable) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// An empty upstream endpoint is allowed: the server still starts (health,
    /// config and recordings work) and sessions fail with a connect error.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.max_stored_recordings == 0 {
            return Err(anyhow::anyhow!("Max stored recordings must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.client_channel_capacity == 0 {
            return Err(anyhow::anyhow!("Client channel capacity must be greater than 0"));
        }

        let threshold = self.audio.barge_in_rms_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow::anyhow!(
                "Barge-in RMS threshold must be in (0, 1], got {}",
                threshold
            ));
        }

        let vad = self.voice.vad_threshold;
        if !(vad > 0.0 && vad <= 1.0) {
            return Err(anyhow::anyhow!("VAD threshold must be in (0, 1], got {}", vad));
        }

        if self.upstream.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed, e.g. `{"audio": {"barge_in_rms_threshold": 0.03}}`.
    /// Changes apply to sessions started afterwards. Upstream connection settings
    /// are fixed at startup and are not accepted here.
    ///
    /// On a validation failure the configuration is left unchanged.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port)?;
            }
        }

        if let Some(voice) = partial_config.get("voice") {
            if let Some(name) = voice.get("voice_name").and_then(|v| v.as_str()) {
                updated.voice.voice_name = name.to_string();
            }
            if let Some(threshold) = voice.get("vad_threshold").and_then(|v| v.as_f64()) {
                updated.voice.vad_threshold = threshold as f32;
            }
            if let Some(padding) = voice.get("vad_prefix_padding_ms").and_then(|v| v.as_u64()) {
                updated.voice.vad_prefix_padding_ms = u32::try_from(padding)?;
            }
            if let Some(silence) = voice.get("vad_silence_duration_ms").and_then(|v| v.as_u64()) {
                updated.voice.vad_silence_duration_ms = u32::try_from(silence)?;
            }
            if let Some(file) = voice.get("instructions_file").and_then(|v| v.as_str()) {
                updated.voice.instructions_file = file.to_string();
            }
            if let Some(greeting) = voice.get("enable_proactive_greeting").and_then(|v| v.as_bool()) {
                updated.voice.enable_proactive_greeting = greeting;
            }
            if let Some(model) = voice.get("noise_reduction").and_then(|v| v.as_str()) {
                updated.voice.noise_reduction = model.to_string();
            }
            if let Some(echo) = voice.get("echo_cancellation").and_then(|v| v.as_bool()) {
                updated.voice.echo_cancellation = echo;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(margin) = audio.get("playback_safety_margin_ms").and_then(|v| v.as_u64()) {
                updated.audio.playback_safety_margin_ms = margin;
            }
            if let Some(threshold) = audio.get("barge_in_rms_threshold").and_then(|v| v.as_f64()) {
                updated.audio.barge_in_rms_threshold = threshold as f32;
            }
            if let Some(interval) = audio.get("barge_in_min_interval_ms").and_then(|v| v.as_u64()) {
                updated.audio.barge_in_min_interval_ms = interval;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(recordings) = performance.get("max_stored_recordings").and_then(|v| v.as_u64()) {
                updated.performance.max_stored_recordings = recordings as usize;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Copy safe to return over HTTP (API key masked).
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.upstream.api_key.is_empty() {
            copy.upstream.api_key = "***".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The defaults match the reference deployment and pass validation.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.upstream.deployment, "gpt-realtime");
        assert_eq!(config.upstream.api_version, "2025-10-01");
        assert_eq!(config.voice.voice_name, "alloy");
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.audio.playback_safety_margin_ms, 20);
        assert_eq!(config.audio.barge_in_rms_threshold, 0.015);
        assert_eq!(config.voice.noise_reduction, "azure_deep_noise_suppression");
        assert!(config.voice.echo_cancellation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.barge_in_rms_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.barge_in_rms_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"barge_in_rms_threshold": 0.03}, "voice": {"voice_name": "verse"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!((config.audio.barge_in_rms_threshold - 0.03).abs() < 1e-6);
        assert_eq!(config.voice.voice_name, "verse");
        assert_eq!(config.server.port, 8000);

        let json = r#"{"voice": {"noise_reduction": "", "echo_cancellation": false}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!(config.voice.noise_reduction.is_empty());
        assert!(!config.voice.echo_cancellation);
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        let json = r#"{"voice": {"voice_name": "verse"}, "performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.voice.voice_name, "alloy");
        assert_eq!(config.performance.max_concurrent_sessions, 10);

        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upstream]
            endpoint = "https://example.openai.azure.com"

            [audio]
            playback_safety_margin_ms = 40
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.endpoint, "https://example.openai.azure.com");
        assert_eq!(config.upstream.deployment, "gpt-realtime");
        assert_eq!(config.audio.playback_safety_margin_ms, 40);
        assert_eq!(config.audio.sample_rate, 24_000);
    }

    #[test]
    fn test_redacted_hides_key() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "secret".to_string();

        let shown = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("secret"));
        assert_eq!(config.upstream.api_key, "secret");
    }
}
