//! Failure classification, reconnect accounting and backoff retries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Failure classes the governor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    UpstreamApi,
    Permission,
    AudioPlayback,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection_error",
            ErrorKind::UpstreamApi => "upstream_api_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::AudioPlayback => "audio_playback_error",
            ErrorKind::Validation => "validation_error",
        }
    }
}

/// What the caller should do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryWithBackoff,
    FailFast,
    LogAndContinue,
}

/// A concrete failure observed somewhere in the relay.
#[derive(Debug, Clone)]
pub enum RelayFailure {
    Connection {
        endpoint: String,
        reason: String,
        attempts: u32,
    },
    UpstreamApi {
        endpoint: String,
        code: String,
        message: String,
    },
    Permission {
        permission: String,
        reason: String,
    },
    AudioPlayback {
        reason: String,
        details: String,
    },
    Validation {
        message: String,
    },
}

impl fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayFailure::Connection {
                endpoint,
                reason,
                attempts,
            } => write!(
                f,
                "connection error to {}: {} (attempts: {})",
                endpoint, reason, attempts
            ),
            RelayFailure::UpstreamApi { code, message, .. } => {
                write!(f, "upstream API error [{}]: {}", code, message)
            }
            RelayFailure::Permission { permission, reason } => {
                write!(f, "permission error for {}: {}", permission, reason)
            }
            RelayFailure::AudioPlayback { reason, details } => {
                write!(f, "audio playback error: {} - {}", reason, details)
            }
            RelayFailure::Validation { message } => write!(f, "validation error: {}", message),
        }
    }
}

impl std::error::Error for RelayFailure {}

/// Classified failure with everything a caller or client needs.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub details: String,
    /// Canned message safe to show to an end user
    pub user_message: String,
    pub recoverable: bool,
    pub action: RecoveryAction,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`ErrorGovernor::retry_with_backoff`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// The shutdown signal fired while waiting between attempts
    Cancelled,
    /// All attempts failed; carries the final error
    Exhausted { attempts: u32, last: E },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "operation cancelled during retry"),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "operation failed after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

type ErrorCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

struct GovernorState {
    connection_attempts: HashMap<String, u32>,
    max_retries: u32,
    retry_interval: Duration,
    circuit_breaker_open: bool,
    callbacks: HashMap<ErrorKind, Vec<ErrorCallback>>,
}

/// Process-wide error governor, explicitly constructed and injected into the
/// relay rather than reached through a global.
pub struct ErrorGovernor {
    inner: RwLock<GovernorState>,
}

impl Default for ErrorGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorGovernor {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GovernorState {
                connection_attempts: HashMap::new(),
                max_retries: 3,
                retry_interval: Duration::from_secs(5),
                circuit_breaker_open: false,
                callbacks: HashMap::new(),
            }),
        }
    }

    /// Classify a failure into a report with user message and recovery action.
    pub fn classify(&self, failure: &RelayFailure) -> ErrorReport {
        let max_retries = self.inner.read().unwrap().max_retries;
        let timestamp = Utc::now();

        match failure {
            RelayFailure::Connection {
                endpoint,
                reason,
                attempts,
            } => {
                let exhausted = *attempts >= max_retries;
                ErrorReport {
                    kind: ErrorKind::Connection,
                    code: "CONNECTION_LOST".to_string(),
                    message: failure.to_string(),
                    details: format!("connection to {} failed: {}", endpoint, reason),
                    user_message: if exhausted {
                        "Connection failed. Please check your network and try again.".to_string()
                    } else {
                        "Connection lost, attempting to reconnect...".to_string()
                    },
                    recoverable: !exhausted,
                    action: if exhausted {
                        RecoveryAction::FailFast
                    } else {
                        RecoveryAction::RetryWithBackoff
                    },
                    timestamp,
                }
            }
            RelayFailure::UpstreamApi { endpoint, code, .. } => ErrorReport {
                kind: ErrorKind::UpstreamApi,
                code: code.clone(),
                message: failure.to_string(),
                details: format!("upstream endpoint: {}", endpoint),
                user_message: "The AI service is temporarily unavailable, please try again later."
                    .to_string(),
                recoverable: false,
                action: RecoveryAction::FailFast,
                timestamp,
            },
            RelayFailure::Permission { permission, reason } => ErrorReport {
                kind: ErrorKind::Permission,
                code: "PERMISSION_DENIED".to_string(),
                message: failure.to_string(),
                details: format!("permission: {}, reason: {}", permission, reason),
                user_message:
                    "Microphone access is required for voice conversations. Please allow it in your browser."
                        .to_string(),
                recoverable: true,
                action: RecoveryAction::FailFast,
                timestamp,
            },
            RelayFailure::AudioPlayback { reason, details } => ErrorReport {
                kind: ErrorKind::AudioPlayback,
                code: "PLAYBACK_FAILED".to_string(),
                message: failure.to_string(),
                details: format!("{}: {}", reason, details),
                user_message: "Audio playback hit a problem, but the conversation can continue."
                    .to_string(),
                recoverable: true,
                action: RecoveryAction::LogAndContinue,
                timestamp,
            },
            RelayFailure::Validation { message } => ErrorReport {
                kind: ErrorKind::Validation,
                code: "VALIDATION_FAILED".to_string(),
                message: failure.to_string(),
                details: message.clone(),
                user_message: "The data was malformed, please retry.".to_string(),
                recoverable: true,
                action: RecoveryAction::LogAndContinue,
                timestamp,
            },
        }
    }

    /// Classify, log and fan a failure out to registered listeners.
    pub fn report(&self, failure: &RelayFailure) -> ErrorReport {
        let report = self.classify(failure);
        self.log_report(&report);
        self.notify(&report);
        report
    }

    /// Record a failed connection attempt against an endpoint.
    ///
    /// Returns the classified report and whether the caller should retry.
    /// Once the attempt counter reaches the retry cap the failure becomes
    /// non-recoverable until [`reset_connection_attempts`] runs.
    ///
    /// [`reset_connection_attempts`]: ErrorGovernor::reset_connection_attempts
    pub fn record_connection_failure(&self, endpoint: &str, reason: &str) -> (ErrorReport, bool) {
        let attempts = {
            let mut state = self.inner.write().unwrap();
            let counter = state
                .connection_attempts
                .entry(endpoint.to_string())
                .or_insert(0);
            *counter += 1;
            *counter
        };

        let failure = RelayFailure::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
            attempts,
        };
        let report = self.report(&failure);
        let should_retry = report.action == RecoveryAction::RetryWithBackoff;

        if !should_retry {
            warn!(endpoint, attempts, "max reconnection attempts reached");
        }

        (report, should_retry)
    }

    /// Clear the attempt counter after a successful (re)connect.
    pub fn reset_connection_attempts(&self, endpoint: &str) {
        let mut state = self.inner.write().unwrap();
        if state.connection_attempts.remove(endpoint).is_some() {
            info!(endpoint, "reset connection attempt counter");
        }
    }

    pub fn connection_attempts(&self, endpoint: &str) -> u32 {
        self.inner
            .read()
            .unwrap()
            .connection_attempts
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Run `op` with linear backoff between failures.
    ///
    /// The delay before attempt `n + 1` is `n * retry_interval`. The shutdown
    /// receiver cancels the wait; a cancelled retry returns
    /// [`RetryError::Cancelled`], exhaustion wraps the final error.
    pub async fn retry_with_backoff<T, E, F, Fut>(
        &self,
        mut op: F,
        max_retries: u32,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_retries = max_retries.max(1);
        let interval = self.retry_interval();
        let mut last_err: Option<E> = None;

        for attempt in 1..=max_retries {
            if *shutdown.borrow() {
                return Err(RetryError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(attempt, max_retries, error = %err, "operation failed, will retry");
                    last_err = Some(err);
                }
            }

            if attempt < max_retries {
                let backoff = interval * attempt;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Err(RetryError::Cancelled);
                        }
                    }
                }
            }
        }

        Err(RetryError::Exhausted {
            attempts: max_retries,
            last: last_err.expect("at least one attempt ran"),
        })
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.inner.write().unwrap().max_retries = max_retries;
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.read().unwrap().max_retries
    }

    pub fn set_retry_interval(&self, interval: Duration) {
        self.inner.write().unwrap().retry_interval = interval;
    }

    pub fn retry_interval(&self) -> Duration {
        self.inner.read().unwrap().retry_interval
    }

    /// Open the circuit breaker. Manual operation only.
    pub fn trip_circuit_breaker(&self) {
        self.inner.write().unwrap().circuit_breaker_open = true;
        warn!("circuit breaker tripped");
    }

    /// Close the circuit breaker.
    pub fn reset_circuit_breaker(&self) {
        self.inner.write().unwrap().circuit_breaker_open = false;
        info!("circuit breaker reset");
    }

    pub fn circuit_breaker_open(&self) -> bool {
        self.inner.read().unwrap().circuit_breaker_open
    }

    /// Register a listener for one failure class.
    pub fn register_callback<F>(&self, kind: ErrorKind, callback: F)
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.inner
            .write()
            .unwrap()
            .callbacks
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Dispatch a report to its listeners without blocking the caller.
    fn notify(&self, report: &ErrorReport) {
        let callbacks: Vec<ErrorCallback> = {
            let state = self.inner.read().unwrap();
            state
                .callbacks
                .get(&report.kind)
                .map(|list| list.to_vec())
                .unwrap_or_default()
        };

        for callback in callbacks {
            let report = report.clone();
            // Listener panics must not take down the reporting path
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { callback(&report) });
            } else {
                callback(&report);
            }
        }
    }

    fn log_report(&self, report: &ErrorReport) {
        error!(
            kind = report.kind.as_str(),
            code = %report.code,
            recoverable = report.recoverable,
            user_message = %report.user_message,
            "{}",
            report.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_classification_table() {
        let governor = ErrorGovernor::new();

        let report = governor.classify(&RelayFailure::Connection {
            endpoint: "wss://example".into(),
            reason: "refused".into(),
            attempts: 1,
        });
        assert_eq!(report.kind, ErrorKind::Connection);
        assert!(report.recoverable);
        assert_eq!(report.action, RecoveryAction::RetryWithBackoff);

        let report = governor.classify(&RelayFailure::UpstreamApi {
            endpoint: "wss://example".into(),
            code: "rate_limited".into(),
            message: "slow down".into(),
        });
        assert_eq!(report.kind, ErrorKind::UpstreamApi);
        assert!(!report.recoverable);
        assert_eq!(report.action, RecoveryAction::FailFast);

        let report = governor.classify(&RelayFailure::Permission {
            permission: "microphone".into(),
            reason: "denied".into(),
        });
        assert!(report.recoverable);
        assert_eq!(report.action, RecoveryAction::FailFast);

        let report = governor.classify(&RelayFailure::AudioPlayback {
            reason: "device busy".into(),
            details: "output in use".into(),
        });
        assert_eq!(report.action, RecoveryAction::LogAndContinue);

        let report = governor.classify(&RelayFailure::Validation {
            message: "bad frame".into(),
        });
        assert_eq!(report.action, RecoveryAction::LogAndContinue);
    }

    #[tokio::test]
    async fn test_connection_attempts_escalate_and_reset() {
        let governor = ErrorGovernor::new();

        let (_, retry1) = governor.record_connection_failure("wss://up", "refused");
        let (_, retry2) = governor.record_connection_failure("wss://up", "refused");
        assert!(retry1);
        assert!(retry2);
        assert_eq!(governor.connection_attempts("wss://up"), 2);

        // Third failure hits the default cap of 3 and stops retrying
        let (report, retry3) = governor.record_connection_failure("wss://up", "refused");
        assert!(!retry3);
        assert!(!report.recoverable);

        governor.reset_connection_attempts("wss://up");
        assert_eq!(governor.connection_attempts("wss://up"), 0);
        let (_, retry_again) = governor.record_connection_failure("wss://up", "refused");
        assert!(retry_again);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_eventual_success() {
        let governor = ErrorGovernor::new();
        governor.set_retry_interval(Duration::from_millis(1));
        let (_tx, mut shutdown) = tokio::sync::watch::channel(false);

        let attempts = AtomicU32::new(0);
        let result = governor
            .retry_with_backoff(
                || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err("not yet")
                        } else {
                            Ok(n)
                        }
                    }
                },
                5,
                &mut shutdown,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_exhaustion() {
        let governor = ErrorGovernor::new();
        governor.set_retry_interval(Duration::from_millis(1));
        let (_tx, mut shutdown) = tokio::sync::watch::channel(false);

        let result: Result<(), _> = governor
            .retry_with_backoff(|| async { Err::<(), _>("always down") }, 3, &mut shutdown)
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "always down");
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_retry_with_backoff_cancelled() {
        let governor = ErrorGovernor::new();
        governor.set_retry_interval(Duration::from_secs(60));
        let (tx, mut shutdown) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
            // Hold the sender open until the retry loop observes the signal
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let result: Result<(), _> = governor
            .retry_with_backoff(|| async { Err::<(), _>("down") }, 3, &mut shutdown)
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        handle.abort();
    }

    #[test]
    fn test_circuit_breaker_manual_toggle() {
        let governor = ErrorGovernor::new();

        assert!(!governor.circuit_breaker_open());
        governor.trip_circuit_breaker();
        assert!(governor.circuit_breaker_open());
        governor.reset_circuit_breaker();
        assert!(!governor.circuit_breaker_open());
    }

    #[tokio::test]
    async fn test_callbacks_fire_for_matching_kind() {
        let governor = ErrorGovernor::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        governor.register_callback(ErrorKind::UpstreamApi, move |report| {
            let _ = tx.send(report.code.clone());
        });

        governor.report(&RelayFailure::UpstreamApi {
            endpoint: "wss://up".into(),
            code: "server_error".into(),
            message: "boom".into(),
        });

        let code = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, "server_error");
    }
}
