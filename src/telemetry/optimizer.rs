//! Outbound WebSocket message shaping.
//!
//! Each session gets a priority queue for server→client messages: priority 1
//! flushes immediately, everything else batches until `batch_size` or
//! `batch_timeout`. Large payloads can be gzip-compressed, and the keepalive
//! interval for client pings is configured here.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Highest priority; bypasses batching entirely.
pub const PRIORITY_IMMEDIATE: u8 = 1;

/// One queued outbound message, payload already serialized.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub payload: String,
    pub priority: u8,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizerConfig {
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub max_message_size: usize,
    pub batch_size: usize,
    #[serde(skip)]
    pub batch_timeout: Duration,
    pub keepalive_enabled: bool,
    #[serde(skip)]
    pub keepalive_interval: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold: 1024,
            max_message_size: 32 * 1024,
            batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            keepalive_enabled: true,
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Partial runtime update from the admin surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptimizerUpdate {
    pub compression_enabled: Option<bool>,
    pub compression_threshold: Option<usize>,
    pub max_message_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub keepalive_enabled: Option<bool>,
    pub keepalive_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub max_message_size: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub keepalive_enabled: bool,
    pub keepalive_interval_ms: u64,
    pub active_queues: usize,
    pub total_queued_messages: usize,
}

struct SessionQueue {
    messages: Vec<QueuedMessage>,
    last_flush: Instant,
}

struct OptimizerState {
    config: OptimizerConfig,
    queues: HashMap<String, SessionQueue>,
}

pub struct WsOptimizer {
    state: RwLock<OptimizerState>,
}

impl Default for WsOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl WsOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            state: RwLock::new(OptimizerState {
                config,
                queues: HashMap::new(),
            }),
        }
    }

    /// Create the outbound queue for a session.
    pub fn register_session(&self, session_id: &str) {
        let mut state = self.state.write().unwrap();
        state.queues.insert(
            session_id.to_string(),
            SessionQueue {
                messages: Vec::new(),
                last_flush: Instant::now(),
            },
        );
        debug!(session_id, "registered outbound message queue");
    }

    /// Drop a session's queue and any undelivered messages.
    pub fn cleanup_session(&self, session_id: &str) {
        let mut state = self.state.write().unwrap();
        if state.queues.remove(session_id).is_some() {
            debug!(session_id, "cleaned up outbound message queue");
        }
    }

    /// Queue an outbound message.
    ///
    /// Returns the batch that must be written right now: non-empty when the
    /// message is priority 1 or the queue reached `batch_size`; empty while
    /// the batch is still accumulating. Unregistered sessions get the message
    /// passed straight through.
    pub fn queue_message(&self, session_id: &str, payload: String, priority: u8) -> Vec<QueuedMessage> {
        let mut state = self.state.write().unwrap();
        let batch_size = state.config.batch_size;

        let message = QueuedMessage {
            payload,
            priority,
            queued_at: Utc::now(),
        };

        let Some(queue) = state.queues.get_mut(session_id) else {
            return vec![message];
        };

        queue.messages.push(message);

        if priority == PRIORITY_IMMEDIATE || queue.messages.len() >= batch_size {
            return Self::flush_queue(queue);
        }

        Vec::new()
    }

    /// Drain the queue if its batch timeout has elapsed.
    pub fn drain_due(&self, session_id: &str) -> Vec<QueuedMessage> {
        let mut state = self.state.write().unwrap();
        let timeout = state.config.batch_timeout;

        let Some(queue) = state.queues.get_mut(session_id) else {
            return Vec::new();
        };

        if queue.messages.is_empty() || queue.last_flush.elapsed() < timeout {
            return Vec::new();
        }

        Self::flush_queue(queue)
    }

    fn flush_queue(queue: &mut SessionQueue) -> Vec<QueuedMessage> {
        let mut batch = std::mem::take(&mut queue.messages);
        // Priority 1 first, stable within a priority level
        batch.sort_by_key(|m| m.priority);
        queue.last_flush = Instant::now();
        batch
    }

    /// Gzip a payload when compression applies and actually helps.
    ///
    /// Returns `None` when compression is disabled, the payload is under the
    /// threshold, or the compressed form is not smaller.
    pub fn maybe_compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        let (enabled, threshold) = {
            let state = self.state.read().unwrap();
            (
                state.config.compression_enabled,
                state.config.compression_threshold,
            )
        };

        if !enabled || data.len() <= threshold {
            return None;
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).ok()?;
        let compressed = encoder.finish().ok()?;

        if compressed.len() < data.len() {
            Some(compressed)
        } else {
            None
        }
    }

    /// Inverse of [`maybe_compress`], for tests and loopback tooling.
    ///
    /// [`maybe_compress`]: WsOptimizer::maybe_compress
    pub fn decompress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn config(&self) -> OptimizerConfig {
        self.state.read().unwrap().config.clone()
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        let state = self.state.read().unwrap();
        state
            .config
            .keepalive_enabled
            .then_some(state.config.keepalive_interval)
    }

    /// Apply a partial configuration update.
    pub fn update_config(&self, update: OptimizerUpdate) {
        let mut state = self.state.write().unwrap();
        let config = &mut state.config;

        if let Some(v) = update.compression_enabled {
            config.compression_enabled = v;
        }
        if let Some(v) = update.compression_threshold {
            config.compression_threshold = v;
        }
        if let Some(v) = update.max_message_size {
            config.max_message_size = v;
        }
        if let Some(v) = update.batch_size {
            config.batch_size = v.max(1);
        }
        if let Some(ms) = update.batch_timeout_ms {
            config.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = update.keepalive_enabled {
            config.keepalive_enabled = v;
        }
        if let Some(ms) = update.keepalive_interval_ms {
            config.keepalive_interval = Duration::from_millis(ms);
        }

        info!("websocket optimizer configuration updated");
    }

    pub fn stats(&self) -> OptimizerStats {
        let state = self.state.read().unwrap();
        let total_queued = state.queues.values().map(|q| q.messages.len()).sum();

        OptimizerStats {
            compression_enabled: state.config.compression_enabled,
            compression_threshold: state.config.compression_threshold,
            max_message_size: state.config.max_message_size,
            batch_size: state.config.batch_size,
            batch_timeout_ms: state.config.batch_timeout.as_millis() as u64,
            keepalive_enabled: state.config.keepalive_enabled,
            keepalive_interval_ms: state.config.keepalive_interval.as_millis() as u64,
            active_queues: state.queues.len(),
            total_queued_messages: total_queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_one_flushes_immediately() {
        let optimizer = WsOptimizer::default();
        optimizer.register_session("s1");

        let batch = optimizer.queue_message("s1", "{\"type\":\"audio_response\"}".into(), 1);
        assert_eq!(batch.len(), 1);
        assert_eq!(optimizer.stats().total_queued_messages, 0);
    }

    #[test]
    fn test_low_priority_batches_until_full() {
        let optimizer = WsOptimizer::new(OptimizerConfig {
            batch_size: 3,
            ..OptimizerConfig::default()
        });
        optimizer.register_session("s1");

        assert!(optimizer.queue_message("s1", "a".into(), 2).is_empty());
        assert!(optimizer.queue_message("s1", "b".into(), 3).is_empty());
        let batch = optimizer.queue_message("s1", "c".into(), 2);
        assert_eq!(batch.len(), 3);
        // Sorted by priority
        assert_eq!(batch[0].priority, 2);
        assert_eq!(batch[2].priority, 3);
    }

    #[test]
    fn test_priority_one_drains_pending_batch() {
        let optimizer = WsOptimizer::default();
        optimizer.register_session("s1");

        assert!(optimizer.queue_message("s1", "low".into(), 3).is_empty());
        let batch = optimizer.queue_message("s1", "urgent".into(), 1);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, "urgent");
    }

    #[test]
    fn test_drain_due_honors_timeout() {
        let optimizer = WsOptimizer::new(OptimizerConfig {
            batch_timeout: Duration::from_millis(0),
            ..OptimizerConfig::default()
        });
        optimizer.register_session("s1");

        optimizer.queue_message("s1", "pending".into(), 2);
        std::thread::sleep(Duration::from_millis(2));

        let batch = optimizer.drain_due("s1");
        assert_eq!(batch.len(), 1);
        assert!(optimizer.drain_due("s1").is_empty());
    }

    #[test]
    fn test_drain_not_due_returns_nothing() {
        let optimizer = WsOptimizer::new(OptimizerConfig {
            batch_timeout: Duration::from_secs(60),
            ..OptimizerConfig::default()
        });
        optimizer.register_session("s1");

        optimizer.queue_message("s1", "pending".into(), 2);
        assert!(optimizer.drain_due("s1").is_empty());
    }

    #[test]
    fn test_unregistered_session_passes_through() {
        let optimizer = WsOptimizer::default();
        let batch = optimizer.queue_message("ghost", "msg".into(), 3);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_compression_round_trip() {
        let optimizer = WsOptimizer::default();
        let payload = "repetitive ".repeat(500);

        let compressed = optimizer.maybe_compress(payload.as_bytes()).unwrap();
        assert!(compressed.len() < payload.len());

        let restored = optimizer.decompress(&compressed).unwrap();
        assert_eq!(restored, payload.as_bytes());
    }

    #[test]
    fn test_small_payloads_skip_compression() {
        let optimizer = WsOptimizer::default();
        assert!(optimizer.maybe_compress(b"tiny").is_none());
    }

    #[test]
    fn test_update_config() {
        let optimizer = WsOptimizer::default();

        optimizer.update_config(OptimizerUpdate {
            compression_enabled: Some(false),
            batch_size: Some(5),
            batch_timeout_ms: Some(250),
            keepalive_enabled: Some(false),
            ..OptimizerUpdate::default()
        });

        let config = optimizer.config();
        assert!(!config.compression_enabled);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_timeout, Duration::from_millis(250));
        assert!(optimizer.keepalive_interval().is_none());
    }

    #[test]
    fn test_cleanup_session_drops_queue() {
        let optimizer = WsOptimizer::default();
        optimizer.register_session("s1");
        optimizer.queue_message("s1", "pending".into(), 2);

        optimizer.cleanup_session("s1");
        assert_eq!(optimizer.stats().active_queues, 0);
        assert_eq!(optimizer.stats().total_queued_messages, 0);
    }
}
