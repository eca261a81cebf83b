//! # Application State
//!
//! One `AppState` is built in `main` and shared with every HTTP handler and
//! WebSocket actor. All relay components are constructed explicitly there and
//! injected here; nothing reaches for a process-wide singleton. HTTP request
//! counters follow the same `Arc<RwLock<_>>` pattern as the component maps.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::audio::AudioPipeline;
use crate::collaborators::{DevTokenValidator, HistoryWriter, NoopHistoryWriter, TokenValidator};
use crate::config::AppConfig;
use crate::recovery::ErrorGovernor;
use crate::relay::UpstreamClient;
use crate::session::{RegistryConfig, SessionRegistry};
use crate::telemetry::{
    ConnectionPool, PerformanceMonitor, PoolConfig, SystemMetricsCollector, WsOptimizer,
};

/// Shared state for handlers and actors. Cheap to clone; every field is an
/// `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,

    pub registry: Arc<SessionRegistry>,
    pub monitor: Arc<PerformanceMonitor>,
    pub governor: Arc<ErrorGovernor>,
    pub audio: Arc<AudioPipeline>,
    pub pool: Arc<ConnectionPool>,
    pub optimizer: Arc<WsOptimizer>,
    pub collector: Arc<SystemMetricsCollector>,
    pub upstream: Arc<UpstreamClient>,

    pub token_validator: Arc<dyn TokenValidator>,
    pub history: Arc<dyn HistoryWriter>,
}

/// HTTP-level counters collected by the metrics middleware.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        registry: Arc<SessionRegistry>,
        monitor: Arc<PerformanceMonitor>,
        governor: Arc<ErrorGovernor>,
        audio: Arc<AudioPipeline>,
        pool: Arc<ConnectionPool>,
        optimizer: Arc<WsOptimizer>,
        collector: Arc<SystemMetricsCollector>,
        upstream: Arc<UpstreamClient>,
        token_validator: Arc<dyn TokenValidator>,
        history: Arc<dyn HistoryWriter>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            monitor,
            governor,
            audio,
            pool,
            optimizer,
            collector,
            upstream,
            token_validator,
            history,
        }
    }

    /// Construct every relay component from one configuration, with the
    /// default development collaborators. Production deployments swap the
    /// validator and history sink through [`AppState::new`].
    pub fn from_config(config: AppConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            max_sessions: config.sessions.max_sessions,
            session_timeout: Duration::from_secs(config.sessions.timeout_minutes * 60),
            cleanup_interval: Duration::from_secs(config.sessions.cleanup_interval_secs.max(1)),
            log_retention_days: config.sessions.log_retention_days,
            privacy_mode: config.sessions.privacy_mode,
        }));
        let monitor = Arc::new(PerformanceMonitor::new());
        let governor = Arc::new(ErrorGovernor::new());
        let audio = Arc::new(AudioPipeline::new());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let optimizer = Arc::new(WsOptimizer::default());
        let collector = Arc::new(SystemMetricsCollector::new());
        collector.set_interval(Duration::from_secs(config.telemetry.collect_interval_secs));

        let upstream = Arc::new(UpstreamClient::new(
            config.upstream.clone(),
            governor.clone(),
            monitor.clone(),
            audio.clone(),
        ));

        Self::new(
            config,
            registry,
            monitor,
            governor,
            audio,
            pool,
            optimizer,
            collector,
            upstream,
            Arc::new(DevTokenValidator),
            Arc::new(NoopHistoryWriter),
        )
    }

    /// Copy of the current configuration; the lock is never held past this
    /// call.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metric_derivations() {
        let metric = EndpointMetric {
            request_count: 10,
            total_duration_ms: 500,
            error_count: 2,
        };

        assert!((metric.average_duration_ms() - 50.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.2).abs() < f64::EPSILON);

        let empty = EndpointMetric::default();
        assert_eq!(empty.average_duration_ms(), 0.0);
        assert_eq!(empty.error_rate(), 0.0);
    }
}
