//! # Voice WebSocket Handler
//!
//! Browser clients connect to `/ws/voice` and hold one voice conversation per
//! connection.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server connects to the voice agent and replies with
//!    `{"type": "session_started", "session_id": ...}`
//! 2. **Audio Streaming**: binary messages carry raw PCM16 little-endian mono
//!    microphone audio at 24 kHz (`{"type": "audio", "audio": <base64>}` also works)
//! 3. **Agent Audio**: binary messages in the other direction carry agent speech
//! 4. **Events**: JSON messages for status, transcripts, `clear_playback` and errors
//! 5. **Teardown**: when either side leaves, the server sends `recording_ready`
//!    and closes the connection
//!
//! ## Actor Model:
//! The actor only moves frames. The relay session runs as a separate task and
//! talks to the actor through a pair of bounded channels, so a slow socket
//! never stalls the upstream connection.

use crate::relay::protocol::{client_channel, ClientFrame, ClientLink, ClientPeer, ServerFrame, ServerMessage};
use crate::relay::session::{RelayConfig, RelaySession};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Close frame descriptions must fit in a 125 byte control frame.
const MAX_CLOSE_DESCRIPTION: usize = 120;

/// WebSocket actor bridging one browser connection to its relay session.
pub struct VoiceWebSocket {
    /// Frames from the browser, consumed by the session
    inbound: mpsc::Sender<ClientFrame>,

    /// Frames for the browser; taken and attached as a stream when the actor starts
    outbound: Option<mpsc::Receiver<ServerFrame>>,

    /// Last ping or pong from the client
    last_heartbeat: Instant,

    peer_addr: String,
}

impl VoiceWebSocket {
    pub fn new(peer: ClientPeer, peer_addr: String) -> Self {
        Self {
            inbound: peer.inbound,
            outbound: Some(peer.outbound),
            last_heartbeat: Instant::now(),
            peer_addr,
        }
    }

    fn forward(&self, frame: ClientFrame) {
        match self.inbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(peer = %self.peer_addr, "Session is behind, dropping client frame");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %self.peer_addr, "Session already ended, ignoring client frame");
            }
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(peer = %self.peer_addr, "Voice WebSocket connection started");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(peer = %act.peer_addr, "WebSocket heartbeat timeout, closing connection");
                act.forward(ClientFrame::Close);
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(peer = %self.peer_addr, "Voice WebSocket connection stopped");
        // Dropping `inbound` with the actor also ends the session's input loop
        self.forward(ClientFrame::Close);
    }
}

/// Handle incoming WebSocket messages from the browser.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.forward(ClientFrame::Binary(data.to_vec())),
            Ok(ws::Message::Text(text)) => self.forward(ClientFrame::Text(text.to_string())),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(peer = %self.peer_addr, ?reason, "Client closed WebSocket");
                self.forward(ClientFrame::Close);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(peer = %self.peer_addr, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(peer = %self.peer_addr, error = %err, "WebSocket protocol error");
                self.forward(ClientFrame::Close);
                ctx.stop();
            }
        }
    }
}

/// Handle frames produced by the relay session.
impl StreamHandler<ServerFrame> for VoiceWebSocket {
    fn handle(&mut self, frame: ServerFrame, ctx: &mut Self::Context) {
        match frame {
            ServerFrame::Binary(audio) => ctx.binary(audio),
            ServerFrame::Message(message) => match serde_json::to_string(&message) {
                Ok(json) => ctx.text(json),
                Err(err) => error!(error = %err, "Failed to serialize server message"),
            },
            ServerFrame::Close { error } => {
                ctx.close(Some(close_reason(error.as_deref())));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(peer = %self.peer_addr, "Session output ended");
        ctx.stop();
    }
}

fn close_reason(error: Option<&str>) -> ws::CloseReason {
    match error {
        None => ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: None,
        },
        Some(message) => ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some(truncate_utf8(message, MAX_CLOSE_DESCRIPTION).to_string()),
        },
    }
}

fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// GET /ws/voice upgrades to a WebSocket and starts a relay session for it.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer_addr = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();
    info!(peer = %peer_addr, "New voice WebSocket connection request");

    let capacity = app_state.get_config().audio.client_channel_capacity;
    let (link, peer) = client_channel(capacity);
    let response = ws::start(VoiceWebSocket::new(peer, peer_addr), &req, stream)?;

    actix_web::rt::spawn(run_voice_session(link, app_state));
    Ok(response)
}

/// Drive one relay session from admission to teardown, keeping the registry
/// and metrics in step.
pub async fn run_voice_session(link: ClientLink, state: web::Data<AppState>) {
    let config = state.get_config();
    let limit = config.performance.max_concurrent_sessions;

    if let Err(err) = state.sessions.ensure_capacity(limit) {
        warn!(limit, "Rejecting voice session: {}", err);
        state.session_rejected();
        let _ = link
            .outbound
            .send(ServerFrame::Message(ServerMessage::Error {
                message: err.to_string(),
            }))
            .await;
        let _ = link
            .outbound
            .send(ServerFrame::Close {
                error: Some(err.to_string()),
            })
            .await;
        return;
    }

    let relay_config = RelayConfig::from_app_config(&config);
    let mut session = match RelaySession::start(
        link,
        state.connector.as_ref(),
        relay_config,
        state.recordings.clone(),
    )
    .await
    {
        Ok(session) => session,
        Err(_) => {
            // The client has already been told why
            state.session_rejected();
            return;
        }
    };

    if let Err(err) = state.sessions.register(session.handle(), limit) {
        warn!(session_id = %session.id(), "Session limit reached during setup");
        state.session_rejected();
        session.fail(&err).await;
        return;
    }
    state.session_started();

    let artifact = session.run().await;

    state.sessions.remove(session.id());
    state.session_finished(session.interruptions());

    match artifact {
        Some(recording) => info!(
            session_id = %session.id(),
            duration_seconds = recording.duration_seconds(),
            interruptions = session.interruptions(),
            "Session finished"
        ),
        None => info!(
            session_id = %session.id(),
            state = ?session.state(),
            "Session finished without a recording"
        ),
    }
}
