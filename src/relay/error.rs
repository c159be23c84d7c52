use crate::audio::pcm::CodecError;
use crate::audio::playback::SchedulerStopped;
use thiserror::Error;

/// Failures inside a relay session.
///
/// Only `Connect`, `MediaAccess` and `SessionLimit` end a session before or
/// instead of normal operation; the rest are reported to the client and the
/// session keeps going where it can.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream connection or its configuration handshake failed
    #[error("upstream connection failed: {0}")]
    Connect(String),

    /// The client could not capture microphone audio
    #[error("microphone unavailable: {0}")]
    MediaAccess(String),

    /// A transport dropped mid-session
    #[error("connection lost: {0}")]
    Transport(String),

    /// Upstream reported an error event
    #[error("upstream error: {0}")]
    UpstreamEvent(String),

    #[error("invalid audio: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid client message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimit(usize),

    #[error(transparent)]
    Scheduler(#[from] SchedulerStopped),
}
