//! # Relay Session
//!
//! One session bridges one client connection and one upstream connection. After
//! the upstream handshake it runs two loops concurrently until either side goes
//! away or a stop is requested:
//!
//! - **Inbound** (client to upstream): record the user frame, run barge-in
//!   detection on it, then forward it upstream
//! - **Outbound** (upstream to client): schedule agent audio for playback and
//!   forward it, record it, and translate upstream signals into status and
//!   transcript messages
//!
//! ## Lifecycle:
//! `connecting` → `handshaking` → `active` → `closing` → `closed`
//!
//! Within `active` the agent status cycles between `listening`, `processing`,
//! `agent_speaking` and `ready`. Both are published on `watch` channels so
//! readers (HTTP handlers, the registry) never block the loops.
//!
//! ## Barge-in:
//! When the user interrupts, the playback scheduler is flushed first. Only the
//! flush that actually mutes playback goes on to cancel the upstream response,
//! tell the client to clear its queue and move the status to `listening`, so
//! overlapping triggers produce exactly one cancellation.
//!
//! Agent audio whose enqueue reply raced a flush is never forwarded: every
//! scheduled entry carries the scheduler's flush epoch, and the outbound loop
//! drops entries older than the last epoch the session cleared.

use crate::audio::barge_in::{BargeInDetector, LevelMeter};
use crate::audio::frame::{AudioFrame, FrameSource};
use crate::audio::mixer::{self, RecordingBuffer, RecordingTrack};
use crate::audio::pcm;
use crate::audio::playback::{PlaybackEntry, SchedulerHandle, SchedulerSnapshot, SchedulerStopped};
use crate::config::AppConfig;
use crate::recordings::{RecordingArtifact, RecordingStore};
use crate::relay::error::RelayError;
use crate::relay::protocol::{
    AgentStatus, ClientFrame, ClientLink, ClientMessage, ServerFrame, ServerMessage, SessionState,
};
use crate::relay::upstream::{
    is_benign_error, UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamSessionConfig,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const UPSTREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub sample_rate: u32,
    pub safety_margin: Duration,
    pub barge_in_threshold: f32,
    pub barge_in_min_interval: Duration,
    pub connect_timeout: Duration,
    pub proactive_greeting: bool,
    pub upstream: UpstreamSessionConfig,
}

impl RelayConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            safety_margin: Duration::from_millis(config.audio.playback_safety_margin_ms),
            barge_in_threshold: config.audio.barge_in_rms_threshold,
            barge_in_min_interval: Duration::from_millis(config.audio.barge_in_min_interval_ms),
            connect_timeout: Duration::from_millis(config.upstream.connect_timeout_ms),
            proactive_greeting: config.voice.enable_proactive_greeting,
            upstream: UpstreamSessionConfig::from_config(config),
        }
    }
}

/// Why the relay loops stopped.
#[derive(Debug)]
enum LoopExit {
    ClientClosed,
    UpstreamClosed,
    StopRequested,
    MediaAccess(String),
    Failed(RelayError),
}

/// The client's outbound queue is closed.
struct ClientGone;

impl From<ClientGone> for LoopExit {
    fn from(_: ClientGone) -> Self {
        LoopExit::ClientClosed
    }
}

impl From<SchedulerStopped> for LoopExit {
    fn from(err: SchedulerStopped) -> Self {
        LoopExit::Failed(err.into())
    }
}

/// State both loops share. Everything here is either a channel sender or
/// lock-free, so the loops can hold it by shared reference.
struct SessionLinks {
    id: String,
    client: mpsc::Sender<ServerFrame>,
    upstream: mpsc::Sender<UpstreamCommand>,
    scheduler: SchedulerHandle,
    status: watch::Sender<AgentStatus>,
    interruptions: Arc<AtomicU64>,
    /// Playback entries from epochs below this were discarded by a flush
    cleared_epoch: AtomicU64,
}

impl SessionLinks {
    /// Queue a frame for the client. A full queue drops the frame.
    fn deliver(&self, frame: ServerFrame) -> Result<(), ClientGone> {
        match self.client.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                let kind = match frame {
                    ServerFrame::Binary(_) => "audio",
                    ServerFrame::Message(_) => "message",
                    ServerFrame::Close { .. } => "close",
                };
                debug!(session_id = %self.id, kind, "Client queue full, frame dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ClientGone),
        }
    }

    fn send_message(&self, message: ServerMessage) -> Result<(), ClientGone> {
        self.deliver(ServerFrame::Message(message))
    }

    fn report(&self, err: RelayError) -> Result<(), LoopExit> {
        warn!(session_id = %self.id, error = %err, "Rejected client input");
        self.send_message(ServerMessage::Error {
            message: err.to_string(),
        })?;
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: AgentStatus) -> Result<(), ClientGone> {
        let previous = self.status.send_replace(status);
        if previous == status {
            return Ok(());
        }
        debug!(session_id = %self.id, status = status.as_str(), "Agent status changed");
        self.send_message(ServerMessage::Status { status })
    }

    async fn command(&self, command: UpstreamCommand) -> Result<(), LoopExit> {
        self.upstream
            .send(command)
            .await
            .map_err(|_| LoopExit::UpstreamClosed)
    }

    /// Forward user audio. Dropped under upstream backpressure.
    fn append_audio(&self, bytes: Vec<u8>) -> Result<(), LoopExit> {
        match self.upstream.try_send(UpstreamCommand::AppendAudio(bytes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(session_id = %self.id, "Upstream queue full, user audio dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(LoopExit::UpstreamClosed),
        }
    }

    fn is_stale(&self, entry: &PlaybackEntry) -> bool {
        entry.epoch < self.cleared_epoch.load(Ordering::SeqCst)
    }

    /// Interrupt the agent. Returns whether this call did the interrupting.
    async fn interrupt(&self, trigger: &'static str) -> Result<bool, LoopExit> {
        let flushed = self.scheduler.flush().await?;
        // Must happen before the next await so the outbound loop sees it first.
        self.cleared_epoch.fetch_max(flushed.epoch, Ordering::SeqCst);
        if flushed.was_muted {
            debug!(session_id = %self.id, trigger, "Playback already interrupted");
            return Ok(false);
        }

        self.command(UpstreamCommand::CancelResponse).await?;
        self.send_message(ServerMessage::ClearPlayback)?;
        self.set_status(AgentStatus::Listening)?;

        let total = self.interruptions.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            session_id = %self.id,
            trigger,
            discarded = flushed.discarded,
            total,
            "Barge-in: agent response cancelled"
        );
        Ok(true)
    }
}

/// Inbound loop state: user audio flowing toward upstream.
struct InputSide<'a> {
    detector: &'a mut BargeInDetector,
    track: &'a mut RecordingTrack,
    next_seq: u64,
    sample_rate: u32,
}

impl InputSide<'_> {
    async fn run(&mut self, links: &SessionLinks, frames: &mut mpsc::Receiver<ClientFrame>) -> LoopExit {
        while let Some(frame) = frames.recv().await {
            if let Err(exit) = self.handle(links, frame).await {
                return exit;
            }
        }
        LoopExit::ClientClosed
    }

    async fn handle(&mut self, links: &SessionLinks, frame: ClientFrame) -> Result<(), LoopExit> {
        let bytes = match frame {
            ClientFrame::Binary(bytes) => bytes,
            ClientFrame::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Audio { audio }) if audio.is_empty() => Vec::new(),
                Ok(ClientMessage::Audio { audio }) => match pcm::decode_base64(&audio) {
                    Ok(bytes) => bytes,
                    Err(err) => return links.report(err.into()),
                },
                Ok(ClientMessage::Ping) => {
                    links.send_message(ServerMessage::Pong)?;
                    return Ok(());
                }
                Ok(ClientMessage::BargeIn) => {
                    if links.status() == AgentStatus::AgentSpeaking {
                        links.interrupt("client request").await?;
                    } else {
                        debug!(session_id = %links.id, "Ignoring barge_in while the agent is silent");
                    }
                    return Ok(());
                }
                Ok(ClientMessage::MediaError { message }) => {
                    return Err(LoopExit::MediaAccess(message));
                }
                Err(err) => return links.report(err.into()),
            },
            ClientFrame::Close => return Err(LoopExit::ClientClosed),
        };

        if bytes.is_empty() {
            trace!(session_id = %links.id, "Skipping empty client audio");
            return Ok(());
        }

        let samples = match pcm::decode_le_bytes(&bytes) {
            Ok(samples) => samples,
            Err(err) => return links.report(err.into()),
        };

        let frame = AudioFrame::new(FrameSource::User, self.next_seq, self.sample_rate, samples);
        self.next_seq += 1;
        let normalized = frame.normalized();
        self.track.push(frame);

        let detection = self
            .detector
            .evaluate(&normalized, links.status(), Instant::now());
        if detection.interrupt {
            links.interrupt("user speech").await?;
        }

        links.append_audio(bytes)
    }
}

/// Outbound loop state: agent audio and signals flowing toward the client.
struct OutputSide<'a> {
    track: &'a mut RecordingTrack,
    next_seq: u64,
    sample_rate: u32,
    response_active: bool,
}

impl OutputSide<'_> {
    async fn run(&mut self, links: &SessionLinks, events: &mut mpsc::Receiver<UpstreamEvent>) -> LoopExit {
        while let Some(event) = events.recv().await {
            if let Err(exit) = self.handle(links, event).await {
                return exit;
            }
        }
        LoopExit::UpstreamClosed
    }

    async fn handle(&mut self, links: &SessionLinks, event: UpstreamEvent) -> Result<(), LoopExit> {
        match event {
            UpstreamEvent::AudioDelta(bytes) if bytes.is_empty() => {
                trace!(session_id = %links.id, "Skipping empty agent audio");
            }
            UpstreamEvent::AudioDelta(bytes) => {
                let samples = match pcm::decode_le_bytes(&bytes) {
                    Ok(samples) => samples,
                    Err(err) => {
                        warn!(session_id = %links.id, error = %err, "Skipping malformed agent audio");
                        return Ok(());
                    }
                };
                let frame = AudioFrame::new(FrameSource::Agent, self.next_seq, self.sample_rate, samples);
                self.next_seq += 1;

                let scheduled = links.scheduler.enqueue(&frame).await?;
                self.track.push(frame);

                match scheduled {
                    Some(entry) if links.is_stale(&entry) => {
                        trace!(session_id = %links.id, seq = entry.seq, "Agent audio flushed while scheduling");
                    }
                    Some(entry) => {
                        trace!(
                            session_id = %links.id,
                            seq = entry.seq,
                            start_ms = entry.start.as_millis() as u64,
                            "Agent audio scheduled"
                        );
                        links.deliver(ServerFrame::Binary(bytes))?;
                    }
                    None => trace!(session_id = %links.id, "Agent audio suppressed after barge-in"),
                }
            }
            UpstreamEvent::UserTranscript(text) => {
                info!(session_id = %links.id, "User: {}", text);
                links.send_message(ServerMessage::UserTranscript { text })?;
            }
            UpstreamEvent::AgentTranscript(text) => {
                info!(session_id = %links.id, "Agent: {}", text);
                links.send_message(ServerMessage::AgentTranscript { text })?;
            }
            UpstreamEvent::AgentText(text) => {
                links.send_message(ServerMessage::AgentText { text })?;
            }
            UpstreamEvent::SpeechStarted => {
                if self.response_active {
                    links.interrupt("upstream speech detection").await?;
                }
                links.set_status(AgentStatus::Listening)?;
            }
            UpstreamEvent::SpeechStopped => {
                links.set_status(AgentStatus::Processing)?;
            }
            UpstreamEvent::ResponseStarted => {
                self.response_active = true;
                links.scheduler.unmute().await?;
                links.set_status(AgentStatus::AgentSpeaking)?;
            }
            UpstreamEvent::AudioDone => {
                links.set_status(AgentStatus::Ready)?;
            }
            UpstreamEvent::ResponseDone => {
                self.response_active = false;
            }
            UpstreamEvent::SessionCreated { session_id } | UpstreamEvent::SessionReady { session_id } => {
                debug!(session_id = %links.id, upstream_session = %session_id, "Upstream session updated");
            }
            UpstreamEvent::Error(message) => {
                if is_benign_error(&message) {
                    debug!(session_id = %links.id, "Ignoring cancel race: {}", message);
                } else {
                    let err = RelayError::UpstreamEvent(message.clone());
                    warn!(session_id = %links.id, error = %err, "Upstream reported an error");
                    // Forwarded verbatim; the client shows upstream's own wording
                    links.send_message(ServerMessage::Error { message })?;
                }
            }
        }
        Ok(())
    }
}

/// Read-only view of a running session plus a stop switch.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    created_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
    status: watch::Receiver<AgentStatus>,
    level: LevelMeter,
    interruptions: Arc<AtomicU64>,
    scheduler: SchedulerHandle,
    stop: Arc<Notify>,
}

/// Listing entry for a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub status: AgentStatus,
    pub input_level: f32,
    pub interruptions: u64,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    pub fn interruptions(&self) -> u64 {
        self.interruptions.load(Ordering::Relaxed)
    }

    pub async fn playback(&self) -> Result<SchedulerSnapshot, SchedulerStopped> {
        self.scheduler.snapshot().await
    }

    /// Ask the session to shut down. Safe to call any number of times.
    pub fn request_stop(&self) {
        self.stop.notify_one();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at,
            state: self.state(),
            status: self.status(),
            input_level: self.level.get(),
            interruptions: self.interruptions(),
        }
    }
}

pub struct RelaySession {
    links: SessionLinks,
    created_at: DateTime<Utc>,
    config: RelayConfig,
    state: watch::Sender<SessionState>,
    stop_signal: Arc<Notify>,
    client_rx: mpsc::Receiver<ClientFrame>,
    upstream_rx: mpsc::Receiver<UpstreamEvent>,
    detector: BargeInDetector,
    recording: RecordingBuffer,
    recordings: RecordingStore,
    closed: bool,
}

impl RelaySession {
    /// Connect upstream, configure the conversation and wait for it to be accepted.
    ///
    /// On failure the client receives an `error` message followed by a close,
    /// and nothing keeps running.
    pub async fn start(
        client: ClientLink,
        connector: &dyn UpstreamConnector,
        config: RelayConfig,
        recordings: RecordingStore,
    ) -> Result<Self, RelayError> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let (state, _) = watch::channel(SessionState::Connecting);
        info!(session_id = %id, "Session connecting");

        let handshake = async {
            let mut link = connector.connect().await?;
            state.send_replace(SessionState::Handshaking);
            debug!(session_id = %id, "Configuring upstream session");

            link.commands
                .send(UpstreamCommand::Configure(config.upstream.clone()))
                .await
                .map_err(|_| RelayError::Connect("upstream closed before configuration".to_string()))?;
            let upstream_id = await_session_ready(&mut link.events).await?;
            Ok::<_, RelayError>((link, upstream_id))
        };

        let outcome = match tokio::time::timeout(config.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Connect(format!(
                "no answer from upstream within {}ms",
                config.connect_timeout.as_millis()
            ))),
        };

        let (link, upstream_id) = match outcome {
            Ok(connected) => connected,
            Err(err) => {
                error!(session_id = %id, error = %err, "Session failed to start");
                let _ = client.outbound.try_send(ServerFrame::Message(ServerMessage::Error {
                    message: err.to_string(),
                }));
                let _ = client.outbound.try_send(ServerFrame::Close {
                    error: Some(err.to_string()),
                });
                state.send_replace(SessionState::Closed);
                return Err(err);
            }
        };

        let (scheduler, _scheduler_task) = SchedulerHandle::spawn(config.safety_margin);
        let (status, _) = watch::channel(AgentStatus::Ready);
        let links = SessionLinks {
            id: id.clone(),
            client: client.outbound,
            upstream: link.commands,
            scheduler,
            status,
            interruptions: Arc::new(AtomicU64::new(0)),
            cleared_epoch: AtomicU64::new(0),
        };

        let session = Self {
            links,
            created_at,
            detector: BargeInDetector::new(config.barge_in_threshold, config.barge_in_min_interval),
            config,
            state,
            stop_signal: Arc::new(Notify::new()),
            client_rx: client.inbound,
            upstream_rx: link.events,
            recording: RecordingBuffer::new(),
            recordings,
            closed: false,
        };

        session.state.send_replace(SessionState::Active);
        info!(
            session_id = %id,
            upstream_session = %upstream_id,
            barge_in_threshold = session.detector.threshold(),
            "Session active"
        );
        let _ = session
            .links
            .send_message(ServerMessage::SessionStarted { session_id: id });

        if session.config.proactive_greeting {
            debug!(session_id = %session.links.id, "Requesting proactive greeting");
            let _ = session.links.upstream.send(UpstreamCommand::CreateResponse).await;
        }

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.links.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn interruptions(&self) -> u64 {
        self.links.interruptions.load(Ordering::Relaxed)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.links.id.clone(),
            created_at: self.created_at,
            state: self.state.subscribe(),
            status: self.links.status.subscribe(),
            level: self.detector.meter(),
            interruptions: self.links.interruptions.clone(),
            scheduler: self.links.scheduler.clone(),
            stop: self.stop_signal.clone(),
        }
    }

    /// Relay until either side disconnects or a stop is requested, then tear down.
    pub async fn run(&mut self) -> Option<RecordingArtifact> {
        if self.closed {
            return None;
        }

        let exit = {
            let links = &self.links;
            let stop = self.stop_signal.clone();
            let mut input = InputSide {
                detector: &mut self.detector,
                track: &mut self.recording.user,
                next_seq: 0,
                sample_rate: self.config.sample_rate,
            };
            let mut output = OutputSide {
                track: &mut self.recording.agent,
                next_seq: 0,
                sample_rate: self.config.sample_rate,
                response_active: false,
            };
            let client_rx = &mut self.client_rx;
            let upstream_rx = &mut self.upstream_rx;

            tokio::select! {
                exit = input.run(links, client_rx) => exit,
                exit = output.run(links, upstream_rx) => exit,
                _ = stop.notified() => LoopExit::StopRequested,
            }
        };

        let close_error = match exit {
            LoopExit::ClientClosed => {
                info!(session_id = %self.links.id, "Client disconnected");
                None
            }
            LoopExit::StopRequested => {
                info!(session_id = %self.links.id, "Stop requested");
                None
            }
            LoopExit::UpstreamClosed => {
                let err = RelayError::Transport("voice service disconnected".to_string());
                warn!(session_id = %self.links.id, error = %err, "Upstream connection ended");
                Some(err.to_string())
            }
            LoopExit::MediaAccess(message) => {
                let err = RelayError::MediaAccess(message);
                warn!(session_id = %self.links.id, error = %err, "Client cannot capture audio");
                Some(err.to_string())
            }
            LoopExit::Failed(err) => {
                error!(session_id = %self.links.id, error = %err, "Session failed");
                Some(err.to_string())
            }
        };

        self.finish(close_error).await
    }

    /// Report a fatal error to the client and tear down.
    pub async fn fail(&mut self, err: &RelayError) -> Option<RecordingArtifact> {
        self.finish(Some(err.to_string())).await
    }

    /// Tear the session down. Only the first call does anything; it returns the
    /// finished recording.
    async fn finish(&mut self, close_error: Option<String>) -> Option<RecordingArtifact> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.state.send_replace(SessionState::Closing);

        if let Err(err) = self.links.scheduler.shutdown().await {
            debug!(session_id = %self.links.id, error = %err, "Scheduler already gone");
        }

        if let Some(message) = &close_error {
            let _ = self.links.send_message(ServerMessage::Error {
                message: message.clone(),
            });
        }

        let artifact = self.recording.take().map(|(user, agent)| {
            debug!(
                session_id = %self.links.id,
                user_samples = user.sample_count(),
                agent_samples = agent.sample_count(),
                "Mixing recording"
            );
            let mixdown = mixer::mixdown(&user, &agent, self.config.sample_rate);
            RecordingArtifact::from_mixdown(&self.links.id, mixdown)
        });

        if let Some(artifact) = &artifact {
            info!(
                session_id = %self.links.id,
                duration_seconds = artifact.duration_seconds(),
                bytes = artifact.wav.len(),
                "Recording stored"
            );
            self.recordings.insert(artifact.clone());
            let _ = self.links.send_message(ServerMessage::RecordingReady {
                session_id: artifact.session_id.clone(),
                url: artifact.url(),
                duration_seconds: artifact.duration_seconds(),
            });
        }

        let _ = tokio::time::timeout(
            UPSTREAM_CLOSE_TIMEOUT,
            self.links.upstream.send(UpstreamCommand::Close),
        )
        .await;
        let _ = self.links.deliver(ServerFrame::Close { error: close_error });
        self.client_rx.close();
        self.upstream_rx.close();

        self.state.send_replace(SessionState::Closed);
        info!(
            session_id = %self.links.id,
            interruptions = self.interruptions(),
            "Session closed"
        );
        artifact
    }
}

async fn await_session_ready(events: &mut mpsc::Receiver<UpstreamEvent>) -> Result<String, RelayError> {
    while let Some(event) = events.recv().await {
        match event {
            UpstreamEvent::SessionReady { session_id } => return Ok(session_id),
            UpstreamEvent::SessionCreated { session_id } => {
                debug!(upstream_session = %session_id, "Upstream session created, waiting for configuration");
            }
            UpstreamEvent::Error(message) => return Err(RelayError::Connect(message)),
            _ => trace!("Skipping upstream event received before session ready"),
        }
    }
    Err(RelayError::Connect("upstream closed during handshake".to_string()))
}
