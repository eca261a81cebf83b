//! # Performance Telemetry
//!
//! Latency and throughput sampling for every leg of the relay, plus the
//! resources that keep it healthy under load:
//!
//! - **Monitor**: per-session audio-latency and WebSocket metrics, threshold
//!   alerting with cooldown, quality scoring.
//! - **Connection pool**: bounded active/idle pooled-connection bookkeeping.
//! - **System collector**: periodic process-level CPU/memory/thread snapshots
//!   with bounded history. Returns snapshots only; it never calls back into
//!   the monitor.
//! - **Optimizer**: per-session outbound priority queue with batching,
//!   compression and keepalive configuration.
//!
//! All components are explicitly constructed in `main` and injected through
//! `AppState`; background collection loops live in `main` under one shutdown
//! scope.

pub mod monitor;
pub mod optimizer;
pub mod pool;
pub mod system;

pub use monitor::{
    AlertEvent, AlertType, AudioLatencyMetric, Direction, PerformanceMonitor,
    PerformanceThresholds, Severity, WebSocketMetric,
};
pub use optimizer::{OptimizerConfig, OptimizerUpdate, QueuedMessage, WsOptimizer};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use system::{HistoricalMetrics, SystemMetricsCollector, SystemSnapshot};
