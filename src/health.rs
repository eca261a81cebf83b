use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let session_stats = state.registry.session_stats();
    let uptime_seconds = state.get_uptime_seconds();

    let session_usage = if session_stats.max_sessions > 0 {
        session_stats.active_sessions as f64 / session_stats.max_sessions as f64
    } else {
        0.0
    };
    let load_status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-relay-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": session_stats.active_sessions
        },
        "sessions": {
            "status": load_status,
            "usage_percent": (session_usage * 100.0).round(),
            "max_sessions": session_stats.max_sessions,
            "active_sessions": session_stats.active_sessions
        },
        "upstream": {
            "endpoint_configured": !config.upstream.endpoint.is_empty(),
            "deployment": config.upstream.deployment,
            "circuit_breaker_open": state.governor.circuit_breaker_open()
        },
        "memory": state.monitor.resource_metrics().map(|m| json!({
            "resident_memory_bytes": m.memory_bytes,
            "memory_percent": m.memory_percent,
            "available": true
        })).unwrap_or_else(|| json!({ "available": false }))
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": state.registry.session_stats(),
        "connection_pool": state.pool.stats()
    }))
}
