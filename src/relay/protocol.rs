//! # Client Protocol
//!
//! Message shapes exchanged with the browser client over the voice WebSocket.
//!
//! ## Frames:
//! - **Binary, client to relay**: raw PCM16 LE mono microphone audio
//! - **Binary, relay to client**: raw PCM16 LE mono agent audio
//! - **Text**: JSON objects discriminated by a `type` field
//!
//! ## Text messages, client to relay:
//! - `{"type":"audio","audio":"<base64 PCM16>"}`
//! - `{"type":"ping"}`
//! - `{"type":"barge_in"}`: the client detected the user talking over playback
//! - `{"type":"media_error","message":"..."}`: the microphone could not be opened
//!
//! ## Text messages, relay to client:
//! `session_started`, `clear_playback`, `user_transcript`, `agent_transcript`,
//! `agent_text`, `status`, `error`, `pong`, `recording_ready`

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Conversational state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Listening,
    Processing,
    AgentSpeaking,
    Ready,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Listening => "listening",
            AgentStatus::Processing => "processing",
            AgentStatus::AgentSpeaking => "agent_speaking",
            AgentStatus::Ready => "ready",
        }
    }
}

/// Lifecycle of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Audio { audio: String },
    Ping,
    BargeIn,
    MediaError { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        session_id: String,
    },
    ClearPlayback,
    UserTranscript {
        text: String,
    },
    AgentTranscript {
        text: String,
    },
    AgentText {
        text: String,
    },
    Status {
        status: AgentStatus,
    },
    Error {
        message: String,
    },
    Pong,
    RecordingReady {
        session_id: String,
        url: String,
        duration_seconds: f64,
    },
}

/// A frame received from the client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

/// A frame to deliver to the client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Binary(Vec<u8>),
    Message(ServerMessage),
    /// Close the connection, with an error description when abnormal
    Close { error: Option<String> },
}

/// The session's side of the client connection.
#[derive(Debug)]
pub struct ClientLink {
    pub inbound: mpsc::Receiver<ClientFrame>,
    pub outbound: mpsc::Sender<ServerFrame>,
}

/// The transport's side of the client connection.
#[derive(Debug)]
pub struct ClientPeer {
    pub inbound: mpsc::Sender<ClientFrame>,
    pub outbound: mpsc::Receiver<ServerFrame>,
}

/// Create a connected link/peer pair with bounded queues in both directions.
pub fn client_channel(capacity: usize) -> (ClientLink, ClientPeer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    (
        ClientLink {
            inbound: inbound_rx,
            outbound: outbound_tx,
        },
        ClientPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse() {
        let audio: ClientMessage = serde_json::from_str(r#"{"type":"audio","audio":"AAA="}"#).unwrap();
        assert_eq!(
            audio,
            ClientMessage::Audio {
                audio: "AAA=".to_string()
            }
        );

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);

        let barge: ClientMessage = serde_json::from_str(r#"{"type":"barge_in"}"#).unwrap();
        assert_eq!(barge, ClientMessage::BargeIn);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let status = serde_json::to_value(ServerMessage::Status {
            status: AgentStatus::AgentSpeaking,
        })
        .unwrap();
        assert_eq!(status, json!({"type": "status", "status": "agent_speaking"}));

        let clear = serde_json::to_value(ServerMessage::ClearPlayback).unwrap();
        assert_eq!(clear, json!({"type": "clear_playback"}));

        let started = serde_json::to_value(ServerMessage::SessionStarted {
            session_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(started, json!({"type": "session_started", "session_id": "abc"}));

        let ready = serde_json::to_value(ServerMessage::RecordingReady {
            session_id: "abc".to_string(),
            url: "/api/v1/recordings/abc".to_string(),
            duration_seconds: 1.5,
        })
        .unwrap();
        assert_eq!(ready["type"], "recording_ready");
        assert_eq!(ready["duration_seconds"], 1.5);
    }

    #[test]
    fn test_status_strings_match_serde() {
        for status in [
            AgentStatus::Listening,
            AgentStatus::Processing,
            AgentStatus::AgentSpeaking,
            AgentStatus::Ready,
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(status.as_str()));
        }
    }
}
