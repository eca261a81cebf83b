//! # Session Registry
//!
//! Owns every voice-session record in the process: admission control against
//! the concurrent-session cap, the lifecycle state machine, the inactivity
//! timeout sweep, per-session connection-quality metrics and the
//! privacy-redacted access log.
//!
//! ## Session Lifecycle:
//! `active -> {completed | timeout | error}`; every non-active status is
//! terminal and has no outgoing transitions.
//!
//! ## Privacy:
//! Access-log entries are redacted at write time when privacy mode is on:
//! the email is stripped and the client IP is coarsened to its first two
//! octets. The redaction is irreversible by construction.

pub mod registry;

pub use registry::{
    AccessLogEntry, ConnectionMetric, ConnectionQuality, EndReason, RegistryConfig, SessionError,
    SessionRegistry, SessionStats, SessionStatus, SessionTimeoutEvent, VoiceSession,
};
