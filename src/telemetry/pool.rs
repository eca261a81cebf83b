//! Bounded connection pool keyed by session id.
//!
//! Acquisition order: reuse the session's existing entry, then re-key an idle
//! entry, then allocate — rejecting once the active cap is reached. Released
//! entries move to a capped idle list; overflow and stale idle entries are
//! discarded.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// One pooled logical connection.
#[derive(Debug, Clone, Serialize)]
pub struct PooledConnection {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_idle: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_idle: 20,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Counter snapshot exposed on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub idle_connections: usize,
    pub max_connections: usize,
    pub max_idle_connections: usize,
    pub total_created: u64,
    pub total_reused: u64,
    pub total_closed: u64,
    pub idle_timeout_secs: u64,
}

struct PoolState {
    active: HashMap<String, PooledConnection>,
    idle: Vec<PooledConnection>,
    total_created: u64,
    total_reused: u64,
    total_closed: u64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    state: RwLock<PoolState>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: RwLock::new(PoolState {
                active: HashMap::new(),
                idle: Vec::new(),
                total_created: 0,
                total_reused: 0,
                total_closed: 0,
            }),
        }
    }

    /// Acquire a connection for a session, returning a copy of the entry.
    ///
    /// Returns `None` once the active cap is reached and nothing is idle.
    pub fn acquire(&self, session_id: &str, user_id: &str) -> Option<PooledConnection> {
        let mut state = self.state.write().unwrap();
        let now = Utc::now();

        // Same session reuses its own entry
        if let Some(conn) = state.active.get_mut(session_id) {
            conn.last_used = now;
            conn.use_count += 1;
            let copy = conn.clone();
            state.total_reused += 1;
            return Some(copy);
        }

        // Re-key an idle entry when one is available
        if let Some(mut conn) = state.idle.pop() {
            conn.session_id = session_id.to_string();
            conn.user_id = user_id.to_string();
            conn.last_used = now;
            conn.use_count += 1;
            conn.is_active = true;
            state.total_reused += 1;
            debug!(session_id, conn_id = %conn.id, "reused idle pooled connection");
            state.active.insert(session_id.to_string(), conn.clone());
            return Some(conn);
        }

        if state.active.len() >= self.config.max_connections {
            info!(
                limit = self.config.max_connections,
                "connection pool limit reached"
            );
            return None;
        }

        let conn = PooledConnection {
            id: format!("conn_{}", Uuid::new_v4()),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_used: now,
            use_count: 1,
            is_active: true,
        };
        state.active.insert(session_id.to_string(), conn.clone());
        state.total_created += 1;
        debug!(session_id, conn_id = %conn.id, "created pooled connection");
        Some(conn)
    }

    /// Return a session's connection to the idle list, or discard it when the
    /// idle list is full.
    pub fn release(&self, session_id: &str) {
        let mut state = self.state.write().unwrap();

        let Some(mut conn) = state.active.remove(session_id) else {
            return;
        };

        if state.idle.len() < self.config.max_idle {
            conn.is_active = false;
            conn.session_id.clear();
            conn.user_id.clear();
            debug!(conn_id = %conn.id, "connection returned to idle pool");
            state.idle.push(conn);
        } else {
            state.total_closed += 1;
            debug!(conn_id = %conn.id, "connection closed, idle pool full");
        }
    }

    /// Drop a session's entry entirely (cascade deletion on session purge).
    pub fn discard(&self, session_id: &str) {
        let mut state = self.state.write().unwrap();
        if state.active.remove(session_id).is_some() {
            state.total_closed += 1;
        }
    }

    /// Discard idle entries unused for longer than the idle timeout.
    pub fn cleanup_stale(&self) -> usize {
        let mut state = self.state.write().unwrap();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let before = state.idle.len();
        state.idle.retain(|conn| conn.last_used >= cutoff);
        let removed = before - state.idle.len();
        state.total_closed += removed as u64;

        if removed > 0 {
            debug!(removed, "discarded stale idle connections");
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.read().unwrap();
        PoolStats {
            active_connections: state.active.len(),
            idle_connections: state.idle.len(),
            max_connections: self.config.max_connections,
            max_idle_connections: self.config.max_idle,
            total_created: state.total_created,
            total_reused: state.total_reused,
            total_closed: state.total_closed,
            idle_timeout_secs: self.config.idle_timeout.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_connections: usize, max_idle: usize) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_connections,
            max_idle,
            idle_timeout: Duration::from_secs(300),
        })
    }

    #[test]
    fn test_capacity_bounds_hold() {
        let pool = small_pool(3, 2);

        assert!(pool.acquire("s1", "u1").is_some());
        assert!(pool.acquire("s2", "u2").is_some());
        assert!(pool.acquire("s3", "u3").is_some());
        // Full: a fourth distinct session is rejected
        assert!(pool.acquire("s4", "u4").is_none());

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 3);
        assert!(stats.active_connections <= stats.max_connections);
    }

    #[test]
    fn test_same_session_reuses() {
        let pool = small_pool(2, 2);

        let first = pool.acquire("s1", "u1").unwrap();
        let second = pool.acquire("s1", "u1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.use_count, 2);
        assert_eq!(pool.stats().total_reused, 1);
        assert_eq!(pool.stats().active_connections, 1);
    }

    #[test]
    fn test_release_moves_to_idle_and_rekeys() {
        let pool = small_pool(2, 2);

        let original = pool.acquire("s1", "u1").unwrap();
        pool.release("s1");

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);

        // A new session picks the idle entry back up under its own key
        let reused = pool.acquire("s2", "u2").unwrap();
        assert_eq!(reused.id, original.id);
        assert_eq!(reused.session_id, "s2");
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[test]
    fn test_idle_overflow_discards() {
        let pool = small_pool(5, 1);

        pool.acquire("s1", "u1").unwrap();
        pool.acquire("s2", "u2").unwrap();
        pool.release("s1");
        pool.release("s2");

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_closed, 1);
    }

    #[test]
    fn test_acquire_release_sequence_respects_caps() {
        let pool = small_pool(4, 2);

        for round in 0..5 {
            for i in 0..6 {
                pool.acquire(&format!("r{}s{}", round, i), "u");
            }
            let stats = pool.stats();
            assert!(stats.active_connections <= 4);
            for i in 0..6 {
                pool.release(&format!("r{}s{}", round, i));
            }
            let stats = pool.stats();
            assert!(stats.idle_connections <= 2);
        }
    }

    #[test]
    fn test_cleanup_stale_idle() {
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: 4,
            max_idle: 4,
            idle_timeout: Duration::from_secs(0),
        });

        pool.acquire("s1", "u1").unwrap();
        pool.release("s1");
        assert_eq!(pool.stats().idle_connections, 1);

        std::thread::sleep(Duration::from_millis(5));
        let removed = pool.cleanup_stale();
        assert_eq!(removed, 1);
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[test]
    fn test_discard_removes_active_entry() {
        let pool = small_pool(2, 2);
        pool.acquire("s1", "u1").unwrap();
        pool.discard("s1");

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_closed, 1);
    }
}
