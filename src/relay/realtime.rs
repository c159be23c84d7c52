//! # Realtime Upstream Adapter
//!
//! Connects to an Azure OpenAI realtime deployment over WebSocket and bridges it
//! to an [`UpstreamLink`].
//!
//! ## Tasks per connection:
//! - **Writer**: encodes [`UpstreamCommand`]s as realtime JSON client events
//! - **Reader**: decodes realtime server events into [`UpstreamEvent`]s
//!
//! Either task ends when its channel or the socket closes; dropping the link
//! therefore tears the connection down.

use crate::audio::pcm;
use crate::config::UpstreamConfig;
use crate::relay::error::RelayError;
use crate::relay::upstream::{
    upstream_channel, UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamLink,
    UpstreamPeer, UpstreamSessionConfig,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

const LINK_CAPACITY: usize = 256;

/// Opens realtime WebSocket connections using the configured deployment.
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    endpoint: String,
    api_key: String,
    deployment: String,
    api_version: String,
}

impl RealtimeConnector {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            deployment: config.deployment.clone(),
            api_version: config.api_version.clone(),
        }
    }

    pub fn url(&self) -> Result<String, RelayError> {
        realtime_url(&self.endpoint, &self.deployment, &self.api_version)
    }
}

/// Build the realtime WebSocket URL from an HTTP(S) or WS(S) endpoint.
pub fn realtime_url(endpoint: &str, deployment: &str, api_version: &str) -> Result<String, RelayError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(RelayError::Connect("upstream endpoint is not configured".to_string()));
    }

    let base = if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if endpoint.starts_with("wss://") || endpoint.starts_with("ws://") {
        endpoint.to_string()
    } else {
        return Err(RelayError::Connect(format!(
            "unsupported endpoint scheme: {}",
            endpoint
        )));
    };

    Ok(format!(
        "{}/openai/realtime?api-version={}&deployment={}",
        base, api_version, deployment
    ))
}

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn connect(&self) -> Result<UpstreamLink, RelayError> {
        let url = self.url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| RelayError::Connect("API key is not a valid header value".to_string()))?;
        request.headers_mut().insert("api-key", key);

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        info!(deployment = %self.deployment, status = %response.status(), "Upstream realtime connection open");

        let (mut sink, mut stream) = socket.split();
        let (link, peer) = upstream_channel(LINK_CAPACITY);
        let UpstreamPeer {
            mut commands,
            events,
        } = peer;

        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let closing = command == UpstreamCommand::Close;
                let message = encode_command(&command);
                if let Err(err) = sink.send(message).await {
                    warn!(error = %err, "Upstream write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Upstream writer finished");
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match decode_event(text.as_str()) {
                        Ok(Some(event)) => {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "Undecodable upstream event"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Upstream closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "Upstream read failed");
                        let _ = events
                            .send(UpstreamEvent::Error(format!("connection lost: {}", err)))
                            .await;
                        break;
                    }
                }
            }
            debug!("Upstream reader finished");
        });

        Ok(link)
    }

    fn describe(&self) -> String {
        format!("azure-openai-realtime ({})", self.deployment)
    }
}

fn session_update(settings: &UpstreamSessionConfig) -> serde_json::Value {
    let mut session = json!({
        "modalities": ["text", "audio"],
        "voice": settings.voice,
        "input_audio_format": "pcm16",
        "output_audio_format": "pcm16",
        "input_audio_transcription": { "model": "whisper-1" },
        "turn_detection": {
            "type": "server_vad",
            "threshold": settings.vad_threshold,
            "prefix_padding_ms": settings.vad_prefix_padding_ms,
            "silence_duration_ms": settings.vad_silence_duration_ms,
        },
    });
    if let Some(instructions) = &settings.instructions {
        session["instructions"] = json!(instructions);
    }
    if let Some(model) = &settings.noise_reduction {
        session["input_audio_noise_reduction"] = json!({ "type": model });
    }
    if settings.echo_cancellation {
        session["input_audio_echo_cancellation"] = json!({ "type": "server_echo_cancellation" });
    }
    json!({ "type": "session.update", "session": session })
}

/// Encode a command as a realtime client event.
pub fn encode_command(command: &UpstreamCommand) -> Message {
    let payload = match command {
        UpstreamCommand::Configure(settings) => session_update(settings),
        UpstreamCommand::AppendAudio(bytes) => json!({
            "type": "input_audio_buffer.append",
            "audio": pcm::encode_base64(bytes),
        }),
        UpstreamCommand::CancelResponse => json!({ "type": "response.cancel" }),
        UpstreamCommand::CreateResponse => json!({ "type": "response.create" }),
        UpstreamCommand::Close => return Message::Close(None),
    };
    Message::Text(payload.to_string().into())
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscript { transcript: String },
    #[serde(
        rename = "response.audio_transcript.done",
        alias = "response.output_audio_transcript.done"
    )]
    AudioTranscript { transcript: String },
    #[serde(rename = "response.text.done", alias = "response.output_text.done")]
    TextDone { text: String },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "response.created")]
    ResponseCreated {},
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    AudioDone {},
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(rename = "error")]
    Error { error: ErrorInfo },
    #[serde(other)]
    Unhandled,
}

/// Decode a realtime server event. `Ok(None)` for events the relay ignores.
pub fn decode_event(text: &str) -> Result<Option<UpstreamEvent>, RelayError> {
    let event: ServerEvent = serde_json::from_str(text)?;
    let decoded = match event {
        ServerEvent::SessionCreated { session } => UpstreamEvent::SessionCreated {
            session_id: session.id.unwrap_or_default(),
        },
        ServerEvent::SessionUpdated { session } => UpstreamEvent::SessionReady {
            session_id: session.id.unwrap_or_default(),
        },
        ServerEvent::AudioDelta { delta } => UpstreamEvent::AudioDelta(pcm::decode_base64(&delta)?),
        ServerEvent::InputTranscript { transcript } => UpstreamEvent::UserTranscript(transcript),
        ServerEvent::AudioTranscript { transcript } => UpstreamEvent::AgentTranscript(transcript),
        ServerEvent::TextDone { text } => UpstreamEvent::AgentText(text),
        ServerEvent::SpeechStarted {} => UpstreamEvent::SpeechStarted,
        ServerEvent::SpeechStopped {} => UpstreamEvent::SpeechStopped,
        ServerEvent::ResponseCreated {} => UpstreamEvent::ResponseStarted,
        ServerEvent::AudioDone {} => UpstreamEvent::AudioDone,
        ServerEvent::ResponseDone {} => UpstreamEvent::ResponseDone,
        ServerEvent::Error { error } => UpstreamEvent::Error(error.message),
        ServerEvent::Unhandled => {
            trace!("Ignoring upstream event");
            return Ok(None);
        }
    };
    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(message: Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    #[test]
    fn test_realtime_url() {
        let url = realtime_url("https://example.openai.azure.com/", "gpt-realtime", "2025-10-01").unwrap();
        assert_eq!(
            url,
            "wss://example.openai.azure.com/openai/realtime?api-version=2025-10-01&deployment=gpt-realtime"
        );

        let url = realtime_url("http://localhost:9000", "d", "v").unwrap();
        assert!(url.starts_with("ws://localhost:9000/openai/realtime"));

        assert!(matches!(realtime_url("", "d", "v"), Err(RelayError::Connect(_))));
        assert!(matches!(realtime_url("ftp://host", "d", "v"), Err(RelayError::Connect(_))));
    }

    #[test]
    fn test_encode_commands() {
        let append = text_of(encode_command(&UpstreamCommand::AppendAudio(vec![1, 0, 2, 0])));
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert_eq!(append["audio"], pcm::encode_base64(&[1, 0, 2, 0]));

        let cancel = text_of(encode_command(&UpstreamCommand::CancelResponse));
        assert_eq!(cancel, json!({"type": "response.cancel"}));

        let settings = UpstreamSessionConfig {
            voice: "alloy".to_string(),
            instructions: Some("Be kind.".to_string()),
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
            noise_reduction: Some("azure_deep_noise_suppression".to_string()),
            echo_cancellation: true,
        };
        let update = text_of(encode_command(&UpstreamCommand::Configure(settings.clone())));
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["voice"], "alloy");
        assert_eq!(update["session"]["instructions"], "Be kind.");
        assert_eq!(update["session"]["turn_detection"]["silence_duration_ms"], 500);
        assert_eq!(
            update["session"]["input_audio_noise_reduction"],
            json!({"type": "azure_deep_noise_suppression"})
        );
        assert_eq!(
            update["session"]["input_audio_echo_cancellation"],
            json!({"type": "server_echo_cancellation"})
        );

        let plain = UpstreamSessionConfig {
            instructions: None,
            noise_reduction: None,
            echo_cancellation: false,
            ..settings
        };
        let update = text_of(encode_command(&UpstreamCommand::Configure(plain)));
        let session = update["session"].as_object().unwrap();
        assert!(!session.contains_key("instructions"));
        assert!(!session.contains_key("input_audio_noise_reduction"));
        assert!(!session.contains_key("input_audio_echo_cancellation"));

        assert!(matches!(encode_command(&UpstreamCommand::Close), Message::Close(None)));
    }

    #[test]
    fn test_decode_events() {
        let ready = decode_event(r#"{"type":"session.updated","session":{"id":"sess_1","voice":"alloy"}}"#).unwrap();
        assert_eq!(
            ready,
            Some(UpstreamEvent::SessionReady {
                session_id: "sess_1".to_string()
            })
        );

        let created = decode_event(r#"{"type":"session.created","session":{"id":"sess_1"}}"#).unwrap();
        assert_eq!(
            created,
            Some(UpstreamEvent::SessionCreated {
                session_id: "sess_1".to_string()
            })
        );

        let delta = format!(
            r#"{{"type":"response.audio.delta","response_id":"r1","delta":"{}"}}"#,
            pcm::encode_base64(&[0x10, 0x00])
        );
        assert_eq!(
            decode_event(&delta).unwrap(),
            Some(UpstreamEvent::AudioDelta(vec![0x10, 0x00]))
        );

        let started = decode_event(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":120}"#).unwrap();
        assert_eq!(started, Some(UpstreamEvent::SpeechStarted));

        let error = decode_event(r#"{"type":"error","error":{"type":"invalid_request_error","message":"boom"}}"#).unwrap();
        assert_eq!(error, Some(UpstreamEvent::Error("boom".to_string())));

        let transcript = decode_event(
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"i","transcript":"hello"}"#,
        )
        .unwrap();
        assert_eq!(transcript, Some(UpstreamEvent::UserTranscript("hello".to_string())));
    }

    #[test]
    fn test_unknown_events_are_skipped() {
        assert_eq!(decode_event(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap(), None);
        assert!(decode_event("not json").is_err());
    }
}
