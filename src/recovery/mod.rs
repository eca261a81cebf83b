//! # Error and Recovery Governor
//!
//! Central classification point for relay failures. Every failure path in the
//! realtime subsystem flows through here so that:
//! - the client always receives a canned, user-facing message,
//! - connection failures are retried with linear backoff up to a cap,
//! - interested listeners get notified through a typed callback registry.
//!
//! The circuit breaker is a manually toggled flag with no automatic trip
//! condition; operations staff flip it through the governor API.

pub mod governor;

pub use governor::{
    ErrorGovernor, ErrorKind, ErrorReport, RecoveryAction, RelayFailure, RetryError,
};
