//! # Collaborator Seams
//!
//! External services the relay consumes but does not implement: token
//! verification and conversation-history persistence. Both sit behind traits
//! so real implementations can be injected without touching the relay; the
//! defaults here are a permissive development validator and a no-op history
//! sink.

use std::fmt;
use tracing::debug;

/// Verified caller identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    MissingToken,
    InvalidToken(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "authentication token is missing"),
            AuthError::InvalidToken(reason) => write!(f, "invalid token: {}", reason),
        }
    }
}

impl std::error::Error for AuthError {}

/// Resolves a bearer token to a caller identity.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Development validator: accepts any non-empty token and derives a stable
/// identity from it. Real credential verification is an external service.
pub struct DevTokenValidator;

impl TokenValidator for DevTokenValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let tag: String = token
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        if tag.is_empty() {
            return Err(AuthError::InvalidToken(
                "token carries no identifying characters".to_string(),
            ));
        }

        Ok(Identity {
            user_id: format!("user-{}", tag),
            email: format!("{}@dev.local", tag),
        })
    }
}

/// Aggregate record handed to the history sink when a session ends.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub message_count: u64,
    pub audio_duration_ms: u64,
    pub error_count: u64,
    pub end_reason: String,
}

/// Fire-and-forget persistence of finished sessions. Implementations must
/// not block; callers invoke this from a detached task.
pub trait HistoryWriter: Send + Sync {
    fn write(&self, record: SessionRecord);
}

pub struct NoopHistoryWriter;

impl HistoryWriter for NoopHistoryWriter {
    fn write(&self, record: SessionRecord) {
        debug!(
            session_id = %record.session_id,
            messages = record.message_count,
            "history write skipped (no-op sink)"
        );
    }
}
