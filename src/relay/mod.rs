//! # Realtime Relay
//!
//! Bridges the client-facing WebSocket (handled by the actor in
//! `crate::websocket`) and the upstream realtime speech endpoint.
//!
//! - `protocol`: tagged unions for both message vocabularies, with a
//!   raw-payload fallback for unknown upstream event types.
//! - `upstream`: the tokio-tungstenite connection — dial with handshake
//!   timeout, a writer task that owns the sink and enforces the 5s write
//!   deadline, and the session configuration message.
//!
//! The response fan-out loop lives next to the actor it feeds, in
//! `crate::websocket`.

pub mod protocol;
pub mod upstream;

pub use protocol::{
    parse_upstream_event, ClientMessage, ClientParseError, RealtimeSessionConfig, ServerMessage,
    UpstreamCommand, UpstreamEvent,
};
pub use upstream::{RelayError, UpstreamClient, UpstreamHandle};
