//! # Voice Relay
//!
//! Bridges a browser voice client to an upstream realtime voice agent.
//!
//! ## Key Components:
//! - **Protocol**: client-facing message shapes and channel links
//! - **Upstream**: transport-independent upstream interface (`UpstreamConnector`)
//! - **Realtime**: WebSocket implementation of the upstream interface
//! - **Session**: the relay loops, barge-in handling and teardown
//! - **Registry**: live sessions and the concurrency limit

pub mod error; // RelayError
pub mod protocol; // Client messages and links
pub mod realtime; // Azure OpenAI realtime adapter
pub mod registry; // Live session tracking
pub mod session; // Relay session lifecycle
pub mod upstream; // Upstream commands, events and connector trait
