//! Session records, admission control and access logging.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current status of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Timeout,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Error => "error",
        }
    }

    /// Every non-active status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    Timeout,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::Timeout => "timeout",
            EndReason::Error => "error",
        }
    }

    fn status(&self) -> SessionStatus {
        match self {
            EndReason::Completed => SessionStatus::Completed,
            EndReason::Timeout => SessionStatus::Timeout,
            EndReason::Error => SessionStatus::Error,
        }
    }
}

/// One logical voice-conversation lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceSession {
    pub id: String,
    pub user_id: String,
    pub user_email: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub audio_duration_ms: u64,
    pub message_count: u64,
    pub error_count: u64,
    pub client_ip: String,
    pub user_agent: String,
}

/// Emitted for every session the timeout sweep transitions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTimeoutEvent {
    pub session_id: String,
    pub user_id: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

/// Rolling connection-quality sample for one session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetric {
    pub session_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub sample_count: u64,
    pub latency_ms: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub min_latency_ms: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub audio_chunk_count: u64,
    pub error_count: u64,
    pub quality: ConnectionQuality,
    pub last_updated: DateTime<Utc>,
}

/// Immutable access-log record; redaction happens before it is stored.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub user_email: String,
    pub session_id: String,
    pub action: String,
    pub resource: String,
    pub method: String,
    pub client_ip: String,
    pub user_agent: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Admission denied: the active-session cap is reached
    CapacityExceeded { max_sessions: usize },
    UnknownSession(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::CapacityExceeded { max_sessions } => {
                write!(f, "maximum concurrent sessions reached: {}", max_sessions)
            }
            SessionError::UnknownSession(id) => write!(f, "unknown session: {}", id),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub cleanup_interval: Duration,
    pub log_retention_days: i64,
    pub privacy_mode: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            session_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            log_retention_days: 30,
            privacy_mode: true,
        }
    }
}

/// Aggregate counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub completed_sessions: usize,
    pub timeout_sessions: usize,
    pub error_sessions: usize,
    pub max_sessions: usize,
    pub session_timeout_minutes: u64,
}

struct RegistryState {
    sessions: HashMap<String, VoiceSession>,
    connection_metrics: HashMap<String, ConnectionMetric>,
    access_logs: Vec<AccessLogEntry>,
    max_sessions: usize,
    session_timeout: chrono::Duration,
    log_retention: chrono::Duration,
    privacy_mode: bool,
    monitoring_enabled: bool,
}

/// Process-wide session registry. One `RwLock` guards all record maps so the
/// timeout sweep is consistent with concurrent admission and activity
/// updates; every accessor returns copies.
pub struct SessionRegistry {
    cleanup_interval: Duration,
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            cleanup_interval: config.cleanup_interval,
            state: RwLock::new(RegistryState {
                sessions: HashMap::new(),
                connection_metrics: HashMap::new(),
                access_logs: Vec::new(),
                max_sessions: config.max_sessions,
                session_timeout: chrono::Duration::from_std(config.session_timeout)
                    .unwrap_or_else(|_| chrono::Duration::minutes(30)),
                log_retention: chrono::Duration::days(config.log_retention_days),
                privacy_mode: config.privacy_mode,
                monitoring_enabled: true,
            }),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Admit and create a session.
    ///
    /// Fails with `CapacityExceeded` once the active count reaches the cap;
    /// the count is checked and the session inserted under one write lock, so
    /// concurrent admissions cannot overshoot.
    pub fn start_session(
        &self,
        user_id: &str,
        user_email: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> Result<VoiceSession, SessionError> {
        let mut state = self.state.write().unwrap();

        let active_count = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count();
        if active_count >= state.max_sessions {
            return Err(SessionError::CapacityExceeded {
                max_sessions: state.max_sessions,
            });
        }

        let now = Utc::now();
        let session = VoiceSession {
            id: format!("session_{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            user_email: user_email.to_string(),
            status: SessionStatus::Active,
            start_time: now,
            last_activity: now,
            end_time: None,
            audio_duration_ms: 0,
            message_count: 0,
            error_count: 0,
            client_ip: client_ip.to_string(),
            user_agent: user_agent.to_string(),
        };
        state.sessions.insert(session.id.clone(), session.clone());

        Self::push_access_log(
            &mut state,
            AccessLogEntry {
                id: format!("log_{}", Uuid::new_v4()),
                timestamp: now,
                user_id: user_id.to_string(),
                user_email: user_email.to_string(),
                session_id: session.id.clone(),
                action: "session_start".to_string(),
                resource: "/ws/realtime".to_string(),
                method: "WebSocket".to_string(),
                client_ip: client_ip.to_string(),
                user_agent: user_agent.to_string(),
                status_code: 200,
                duration_ms: 0,
                error: None,
                metadata: serde_json::Value::Null,
            },
        );

        info!(session_id = %session.id, user_id, "voice session started");
        Ok(session)
    }

    /// Bump activity and message count; no-op on unknown or terminal ids.
    pub fn update_session_activity(&self, session_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            if session.status == SessionStatus::Active {
                session.last_activity = Utc::now();
                session.message_count += 1;
            }
        }
    }

    /// Accumulate processed audio duration for a session.
    pub fn record_audio(&self, session_id: &str, duration_ms: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.audio_duration_ms += duration_ms;
        }
    }

    /// Count an error against a session.
    pub fn record_session_error(&self, session_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.error_count += 1;
        }
    }

    /// Terminate an active session and log its aggregate counters.
    ///
    /// Terminal sessions are left untouched: there are no outgoing
    /// transitions from completed/timeout/error.
    pub fn end_session(&self, session_id: &str, reason: EndReason) {
        let mut state = self.state.write().unwrap();

        let log_entry = {
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            if session.status.is_terminal() {
                debug!(session_id, "ignoring end_session on terminal session");
                return;
            }

            let now = Utc::now();
            session.status = reason.status();
            session.end_time = Some(now);

            let duration = now.signed_duration_since(session.start_time);
            info!(
                session_id,
                reason = reason.as_str(),
                duration_secs = duration.num_seconds(),
                "voice session ended"
            );

            AccessLogEntry {
                id: format!("log_{}", Uuid::new_v4()),
                timestamp: now,
                user_id: session.user_id.clone(),
                user_email: session.user_email.clone(),
                session_id: session_id.to_string(),
                action: "session_end".to_string(),
                resource: "/ws/realtime".to_string(),
                method: "WebSocket".to_string(),
                client_ip: session.client_ip.clone(),
                user_agent: session.user_agent.clone(),
                status_code: 200,
                duration_ms: duration.num_milliseconds().max(0) as u64,
                error: None,
                metadata: json!({
                    "reason": reason.as_str(),
                    "message_count": session.message_count,
                    "audio_duration_ms": session.audio_duration_ms,
                    "error_count": session.error_count,
                }),
            }
        };

        Self::push_access_log(&mut state, log_entry);
    }

    /// Sweep active sessions past the inactivity timeout into `timeout`.
    ///
    /// Terminal sessions are never touched. Returns the newly timed-out
    /// sessions so callers can tear down their sockets.
    pub fn check_session_timeout(&self) -> Vec<SessionTimeoutEvent> {
        let mut state = self.state.write().unwrap();
        let now = Utc::now();
        let timeout = state.session_timeout;
        let mut events = Vec::new();

        for session in state.sessions.values_mut() {
            if session.status != SessionStatus::Active {
                continue;
            }
            let idle = now.signed_duration_since(session.last_activity);
            if idle > timeout {
                session.status = SessionStatus::Timeout;
                session.end_time = Some(now);

                warn!(
                    session_id = %session.id,
                    user_id = %session.user_id,
                    idle_secs = idle.num_seconds(),
                    "session timed out"
                );
                events.push(SessionTimeoutEvent {
                    session_id: session.id.clone(),
                    user_id: session.user_id.clone(),
                    duration_seconds: now
                        .signed_duration_since(session.start_time)
                        .num_milliseconds() as f64
                        / 1000.0,
                });
            }
        }

        events
    }

    pub fn session(&self, session_id: &str) -> Option<VoiceSession> {
        self.state.read().unwrap().sessions.get(session_id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<VoiceSession> {
        self.state
            .read()
            .unwrap()
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect()
    }

    pub fn session_stats(&self) -> SessionStats {
        let state = self.state.read().unwrap();
        let mut stats = SessionStats {
            total_sessions: state.sessions.len(),
            active_sessions: 0,
            completed_sessions: 0,
            timeout_sessions: 0,
            error_sessions: 0,
            max_sessions: state.max_sessions,
            session_timeout_minutes: state.session_timeout.num_minutes().max(0) as u64,
        };

        for session in state.sessions.values() {
            match session.status {
                SessionStatus::Active => stats.active_sessions += 1,
                SessionStatus::Completed => stats.completed_sessions += 1,
                SessionStatus::Timeout => stats.timeout_sessions += 1,
                SessionStatus::Error => stats.error_sessions += 1,
                SessionStatus::Paused => {}
            }
        }

        stats
    }

    /// Begin connection-quality tracking for a session.
    pub fn start_connection_monitoring(&self, session_id: &str, user_id: &str) {
        let mut state = self.state.write().unwrap();
        if !state.monitoring_enabled {
            return;
        }

        let now = Utc::now();
        state.connection_metrics.insert(
            session_id.to_string(),
            ConnectionMetric {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                connected_at: now,
                sample_count: 0,
                latency_ms: 0.0,
                avg_latency_ms: 0.0,
                max_latency_ms: 0.0,
                min_latency_ms: f64::MAX,
                bytes_sent: 0,
                bytes_received: 0,
                audio_chunk_count: 0,
                error_count: 0,
                quality: ConnectionQuality::Unknown,
                last_updated: now,
            },
        );
    }

    /// Fold one quality sample into a session's connection metric.
    pub fn update_connection_metric(
        &self,
        session_id: &str,
        latency_ms: f64,
        bytes_received: u64,
        is_error: bool,
    ) {
        let mut state = self.state.write().unwrap();
        if !state.monitoring_enabled {
            return;
        }

        let Some(metric) = state.connection_metrics.get_mut(session_id) else {
            return;
        };

        if latency_ms > 0.0 {
            metric.sample_count += 1;
            metric.latency_ms = latency_ms;
            metric.avg_latency_ms = (metric.avg_latency_ms * (metric.sample_count - 1) as f64
                + latency_ms)
                / metric.sample_count as f64;
            metric.max_latency_ms = metric.max_latency_ms.max(latency_ms);
            metric.min_latency_ms = metric.min_latency_ms.min(latency_ms);
        }

        if bytes_received > 0 {
            metric.bytes_received += bytes_received;
            metric.audio_chunk_count += 1;
        }

        if is_error {
            metric.error_count += 1;
        }

        metric.quality = Self::classify_quality(metric);
        metric.last_updated = Utc::now();
    }

    /// Deterministic quality classification from latency and error rate.
    fn classify_quality(metric: &ConnectionMetric) -> ConnectionQuality {
        if metric.sample_count == 0 {
            return ConnectionQuality::Unknown;
        }

        let avg = metric.avg_latency_ms;
        let error_rate = metric.error_count as f64 / (metric.sample_count + 1) as f64;

        if avg < 100.0 && error_rate < 0.01 {
            ConnectionQuality::Excellent
        } else if avg < 200.0 && error_rate < 0.05 {
            ConnectionQuality::Good
        } else if avg < 500.0 && error_rate < 0.1 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }

    pub fn connection_quality(&self, session_id: &str) -> Option<ConnectionMetric> {
        self.state
            .read()
            .unwrap()
            .connection_metrics
            .get(session_id)
            .cloned()
    }

    /// Record an administrative access; redaction applies before storage.
    #[allow(clippy::too_many_arguments)]
    pub fn log_access(
        &self,
        user_id: &str,
        user_email: &str,
        session_id: &str,
        action: &str,
        resource: &str,
        method: &str,
        client_ip: &str,
        user_agent: &str,
        status_code: u16,
        duration_ms: u64,
        error: Option<String>,
    ) {
        let mut state = self.state.write().unwrap();
        Self::push_access_log(
            &mut state,
            AccessLogEntry {
                id: format!("log_{}", Uuid::new_v4()),
                timestamp: Utc::now(),
                user_id: user_id.to_string(),
                user_email: user_email.to_string(),
                session_id: session_id.to_string(),
                action: action.to_string(),
                resource: resource.to_string(),
                method: method.to_string(),
                client_ip: client_ip.to_string(),
                user_agent: user_agent.to_string(),
                status_code,
                duration_ms,
                error,
                metadata: serde_json::Value::Null,
            },
        );
    }

    fn push_access_log(state: &mut RegistryState, mut entry: AccessLogEntry) {
        if state.privacy_mode {
            entry.user_email.clear();
            entry.client_ip = mask_ip(&entry.client_ip);
        }

        debug!(
            action = %entry.action,
            resource = %entry.resource,
            client_ip = %entry.client_ip,
            status = entry.status_code,
            "access log recorded"
        );
        state.access_logs.push(entry);
    }

    /// Newest-first page of access logs.
    pub fn access_logs(&self, limit: usize, page: usize) -> Vec<AccessLogEntry> {
        let state = self.state.read().unwrap();
        let limit = limit.clamp(1, 1000);

        state
            .access_logs
            .iter()
            .rev()
            .skip(page.saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn access_log_count(&self) -> usize {
        self.state.read().unwrap().access_logs.len()
    }

    /// Purge terminated sessions past retention and stale log entries.
    ///
    /// Returns the purged session ids so the caller can cascade-delete the
    /// associated telemetry and pooled connections.
    pub fn cleanup(&self) -> Vec<String> {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.write().unwrap();
        let session_retention = chrono::Duration::hours(24);
        let log_retention = state.log_retention;

        let purged: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.status.is_terminal()
                    && session
                        .end_time
                        .map(|end| now.signed_duration_since(end) > session_retention)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &purged {
            state.sessions.remove(id);
            state.connection_metrics.remove(id);
        }

        let before = state.access_logs.len();
        state
            .access_logs
            .retain(|entry| now.signed_duration_since(entry.timestamp) <= log_retention);

        info!(
            purged_sessions = purged.len(),
            purged_logs = before - state.access_logs.len(),
            remaining_sessions = state.sessions.len(),
            "registry cleanup completed"
        );
        purged
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        let mut state = self.state.write().unwrap();
        state.session_timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::minutes(30));
        info!(timeout_secs = timeout.as_secs(), "session timeout updated");
    }

    pub fn session_timeout(&self) -> Duration {
        self.state
            .read()
            .unwrap()
            .session_timeout
            .to_std()
            .unwrap_or(Duration::from_secs(30 * 60))
    }

    pub fn set_max_sessions(&self, max_sessions: usize) {
        self.state.write().unwrap().max_sessions = max_sessions;
        info!(max_sessions, "max concurrent sessions updated");
    }

    pub fn enable_monitoring(&self) {
        self.state.write().unwrap().monitoring_enabled = true;
        info!("connection monitoring enabled");
    }

    pub fn disable_monitoring(&self) {
        self.state.write().unwrap().monitoring_enabled = false;
        info!("connection monitoring disabled");
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.state.read().unwrap().monitoring_enabled
    }

    pub fn set_privacy_mode(&self, enabled: bool) {
        self.state.write().unwrap().privacy_mode = enabled;
        info!(enabled, "privacy mode updated");
    }

    pub fn privacy_mode(&self) -> bool {
        self.state.read().unwrap().privacy_mode
    }
}

/// Coarsen an IPv4-style address to its first two octets.
///
/// `192.168.1.100` becomes `192.168.*.*`; anything without two dots is
/// masked entirely.
fn mask_ip(ip: &str) -> String {
    if ip.is_empty() {
        return String::new();
    }

    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() == 4 {
        format!("{}.{}.*.*", parts[0], parts[1])
    } else {
        "*".repeat(ip.len().min(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry_with_cap(max_sessions: usize) -> SessionRegistry {
        SessionRegistry::new(RegistryConfig {
            max_sessions,
            ..RegistryConfig::default()
        })
    }

    #[test]
    fn test_admission_cap() {
        let registry = registry_with_cap(100);

        let mut failures = 0;
        for i in 0..101 {
            match registry.start_session(&format!("u{}", i), "u@example.com", "10.0.0.1", "test") {
                Ok(_) => {}
                Err(SessionError::CapacityExceeded { max_sessions }) => {
                    failures += 1;
                    assert_eq!(max_sessions, 100);
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(failures, 1);
        assert_eq!(registry.session_stats().active_sessions, 100);
    }

    #[test]
    fn test_concurrent_admission_never_overshoots() {
        let registry = Arc::new(registry_with_cap(100));
        let mut handles = Vec::new();

        for i in 0..101 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry
                    .start_session(&format!("u{}", i), "u@example.com", "10.0.0.1", "test")
                    .is_ok()
            }));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(successes, 100);
        assert_eq!(registry.session_stats().active_sessions, 100);
    }

    #[test]
    fn test_ending_a_session_frees_capacity() {
        let registry = registry_with_cap(1);

        let session = registry
            .start_session("u1", "u1@example.com", "10.0.0.1", "test")
            .unwrap();
        assert!(registry
            .start_session("u2", "u2@example.com", "10.0.0.2", "test")
            .is_err());

        registry.end_session(&session.id, EndReason::Completed);
        assert!(registry
            .start_session("u2", "u2@example.com", "10.0.0.2", "test")
            .is_ok());
    }

    #[test]
    fn test_timeout_sweep_only_touches_idle_active_sessions() {
        let registry = registry_with_cap(10);

        let idle = registry
            .start_session("u1", "u1@example.com", "10.0.0.1", "test")
            .unwrap();
        let ended = registry
            .start_session("u2", "u2@example.com", "10.0.0.2", "test")
            .unwrap();
        registry.end_session(&ended.id, EndReason::Completed);

        // Nothing is idle past a 30 minute timeout yet
        assert!(registry.check_session_timeout().is_empty());

        // With a zero timeout every active session is idle
        registry.set_session_timeout(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        let events = registry.check_session_timeout();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, idle.id);
        assert_eq!(
            registry.session(&idle.id).unwrap().status,
            SessionStatus::Timeout
        );
        // The completed session kept its terminal status
        assert_eq!(
            registry.session(&ended.id).unwrap().status,
            SessionStatus::Completed
        );

        // A second sweep finds nothing new
        assert!(registry.check_session_timeout().is_empty());
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_transitions() {
        let registry = registry_with_cap(10);
        let session = registry
            .start_session("u1", "u1@example.com", "10.0.0.1", "test")
            .unwrap();

        registry.end_session(&session.id, EndReason::Error);
        let after_error = registry.session(&session.id).unwrap();
        assert_eq!(after_error.status, SessionStatus::Error);

        registry.end_session(&session.id, EndReason::Completed);
        assert_eq!(
            registry.session(&session.id).unwrap().status,
            SessionStatus::Error
        );
        assert_eq!(
            registry.session(&session.id).unwrap().end_time,
            after_error.end_time
        );
    }

    #[test]
    fn test_activity_updates_bump_counters() {
        let registry = registry_with_cap(10);
        let session = registry
            .start_session("u1", "u1@example.com", "10.0.0.1", "test")
            .unwrap();

        registry.update_session_activity(&session.id);
        registry.update_session_activity(&session.id);
        registry.record_audio(&session.id, 250);
        registry.record_session_error(&session.id);
        // Unknown ids are a no-op
        registry.update_session_activity("missing");

        let updated = registry.session(&session.id).unwrap();
        assert_eq!(updated.message_count, 2);
        assert_eq!(updated.audio_duration_ms, 250);
        assert_eq!(updated.error_count, 1);
        assert!(updated.last_activity >= session.last_activity);
    }

    #[test]
    fn test_access_log_redaction() {
        let registry = registry_with_cap(10);
        registry
            .start_session("u1", "user@example.com", "192.168.1.100", "test-agent")
            .unwrap();

        let logs = registry.access_logs(10, 0);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].user_email, "");
        assert_eq!(logs[0].client_ip, "192.168.*.*");
    }

    #[test]
    fn test_access_log_without_privacy_mode() {
        let registry = SessionRegistry::new(RegistryConfig {
            privacy_mode: false,
            ..RegistryConfig::default()
        });
        registry
            .start_session("u1", "user@example.com", "192.168.1.100", "test-agent")
            .unwrap();

        let logs = registry.access_logs(10, 0);
        assert_eq!(logs[0].user_email, "user@example.com");
        assert_eq!(logs[0].client_ip, "192.168.1.100");
    }

    #[test]
    fn test_access_log_pagination_newest_first() {
        let registry = registry_with_cap(100);
        for i in 0..5 {
            registry.log_access(
                &format!("u{}", i),
                "",
                "",
                "admin_read",
                "/api/v1/monitoring/sessions/stats",
                "GET",
                "10.0.0.1",
                "curl",
                200,
                3,
                None,
            );
        }

        let first_page = registry.access_logs(2, 0);
        let second_page = registry.access_logs(2, 1);
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].user_id, "u4");
        assert_eq!(second_page[0].user_id, "u2");
    }

    #[test]
    fn test_connection_quality_classification() {
        let registry = registry_with_cap(10);
        registry.start_connection_monitoring("s1", "u1");

        // Low latency, no errors
        for _ in 0..10 {
            registry.update_connection_metric("s1", 50.0, 1024, false);
        }
        assert_eq!(
            registry.connection_quality("s1").unwrap().quality,
            ConnectionQuality::Excellent
        );

        registry.start_connection_monitoring("s2", "u2");
        for _ in 0..10 {
            registry.update_connection_metric("s2", 150.0, 1024, false);
        }
        assert_eq!(
            registry.connection_quality("s2").unwrap().quality,
            ConnectionQuality::Good
        );

        registry.start_connection_monitoring("s3", "u3");
        for _ in 0..10 {
            registry.update_connection_metric("s3", 400.0, 1024, false);
        }
        assert_eq!(
            registry.connection_quality("s3").unwrap().quality,
            ConnectionQuality::Fair
        );

        registry.start_connection_monitoring("s4", "u4");
        for _ in 0..10 {
            registry.update_connection_metric("s4", 800.0, 1024, true);
        }
        assert_eq!(
            registry.connection_quality("s4").unwrap().quality,
            ConnectionQuality::Poor
        );
    }

    #[test]
    fn test_cleanup_purges_old_terminated_sessions() {
        let registry = registry_with_cap(10);
        let old = registry
            .start_session("u1", "u1@example.com", "10.0.0.1", "test")
            .unwrap();
        let live = registry
            .start_session("u2", "u2@example.com", "10.0.0.2", "test")
            .unwrap();
        registry.start_connection_monitoring(&old.id, "u1");
        registry.end_session(&old.id, EndReason::Completed);

        // Just-ended sessions survive the sweep
        assert!(registry.cleanup().is_empty());

        // 25 hours later the terminated session and its metric are gone
        let future = Utc::now() + chrono::Duration::hours(25);
        let purged = registry.cleanup_at(future);
        assert_eq!(purged, vec![old.id.clone()]);
        assert!(registry.session(&old.id).is_none());
        assert!(registry.connection_quality(&old.id).is_none());
        assert!(registry.session(&live.id).is_some());
    }

    #[test]
    fn test_cleanup_expires_old_logs() {
        let registry = registry_with_cap(10);
        registry.log_access(
            "u1", "", "", "admin_read", "/r", "GET", "10.0.0.1", "curl", 200, 1, None,
        );
        assert_eq!(registry.access_log_count(), 1);

        let future = Utc::now() + chrono::Duration::days(31);
        registry.cleanup_at(future);
        assert_eq!(registry.access_log_count(), 0);
    }

    #[test]
    fn test_mask_ip_shapes() {
        assert_eq!(mask_ip("192.168.1.100"), "192.168.*.*");
        assert_eq!(mask_ip(""), "");
        assert_eq!(mask_ip("::1"), "***");
    }
}
