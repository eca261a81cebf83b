//! Performance telemetry administration: per-session metrics, resource
//! snapshots, pool stats, thresholds and optimizer parameters.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::telemetry::{OptimizerUpdate, PerformanceThresholds};

pub async fn get_audio_metrics(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let metrics = state
        .monitor
        .audio_metrics(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("no audio metrics for {}", session_id)))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": metrics,
    })))
}

pub async fn get_websocket_metrics(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let metrics = state
        .monitor
        .websocket_metrics(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("no websocket metrics for {}", session_id)))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": metrics,
    })))
}

pub async fn get_resource_metrics(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": {
            "current": state.monitor.resource_metrics(),
            "history": state.collector.historical(),
        },
    }))
}

pub async fn get_pool_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": state.pool.stats(),
    }))
}

pub async fn get_performance_overview(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": {
            "monitoring_enabled": state.monitor.is_enabled(),
            "thresholds": state.monitor.thresholds(),
            "resource_metrics": state.monitor.resource_metrics(),
            "historical_metrics": state.collector.historical(),
            "connection_pool": state.pool.stats(),
            "websocket_optimization": state.optimizer.stats(),
            "circuit_breaker_open": state.governor.circuit_breaker_open(),
            "timestamp": chrono::Utc::now().timestamp_millis(),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct ThresholdsRequest {
    pub max_audio_latency_ms: f64,
    pub max_message_latency_ms: f64,
    pub max_cpu_percent: f64,
    pub max_memory_usage_mb: u64,
    pub max_worker_threads: usize,
    pub min_quality_score: f64,
    pub alert_cooldown_secs: Option<u64>,
}

pub async fn set_thresholds(
    state: web::Data<AppState>,
    body: web::Json<ThresholdsRequest>,
) -> AppResult<HttpResponse> {
    if !(100.0..=5000.0).contains(&body.max_audio_latency_ms) {
        return Err(AppError::ValidationError(
            "max_audio_latency_ms must be between 100 and 5000".to_string(),
        ));
    }
    if !(10.0..=1000.0).contains(&body.max_message_latency_ms) {
        return Err(AppError::ValidationError(
            "max_message_latency_ms must be between 10 and 1000".to_string(),
        ));
    }
    if !(10.0..=100.0).contains(&body.max_cpu_percent) {
        return Err(AppError::ValidationError(
            "max_cpu_percent must be between 10 and 100".to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&body.min_quality_score) {
        return Err(AppError::ValidationError(
            "min_quality_score must be between 0 and 100".to_string(),
        ));
    }

    let previous = state.monitor.thresholds();
    state.monitor.set_thresholds(PerformanceThresholds {
        max_audio_latency_ms: body.max_audio_latency_ms,
        max_message_latency_ms: body.max_message_latency_ms,
        max_cpu_percent: body.max_cpu_percent,
        max_memory_bytes: body.max_memory_usage_mb * 1024 * 1024,
        max_worker_threads: body.max_worker_threads,
        min_quality_score: body.min_quality_score,
        alert_cooldown: body
            .alert_cooldown_secs
            .map(Duration::from_secs)
            .unwrap_or(previous.alert_cooldown),
    });

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "performance thresholds updated",
        "data": state.monitor.thresholds(),
    })))
}

pub async fn get_thresholds(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": state.monitor.thresholds(),
    }))
}

pub async fn update_optimizer(
    state: web::Data<AppState>,
    body: web::Json<OptimizerUpdate>,
) -> HttpResponse {
    state.optimizer.update_config(body.into_inner());
    HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "websocket optimization updated",
        "data": state.optimizer.stats(),
    }))
}

pub async fn enable_performance_monitoring(state: web::Data<AppState>) -> HttpResponse {
    state.monitor.enable();
    HttpResponse::Ok().json(json!({ "status": "success", "message": "performance monitoring enabled" }))
}

pub async fn disable_performance_monitoring(state: web::Data<AppState>) -> HttpResponse {
    state.monitor.disable();
    HttpResponse::Ok().json(json!({ "status": "success", "message": "performance monitoring disabled" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_thresholds_round_trip() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/thresholds", web::put().to(set_thresholds))
                .route("/thresholds", web::get().to(get_thresholds)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/thresholds")
                .set_json(json!({
                    "max_audio_latency_ms": 400.0,
                    "max_message_latency_ms": 50.0,
                    "max_cpu_percent": 75.0,
                    "max_memory_usage_mb": 512,
                    "max_worker_threads": 500,
                    "min_quality_score": 60.0
                }))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());

        let thresholds = state.monitor.thresholds();
        assert_eq!(thresholds.max_audio_latency_ms, 400.0);
        assert_eq!(thresholds.max_memory_bytes, 512 * 1024 * 1024);
        // Unspecified cooldown keeps its previous value
        assert_eq!(thresholds.alert_cooldown, Duration::from_secs(300));
    }

    #[actix_web::test]
    async fn test_thresholds_validation() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/thresholds", web::put().to(set_thresholds)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/thresholds")
                .set_json(json!({
                    "max_audio_latency_ms": 50.0,
                    "max_message_latency_ms": 50.0,
                    "max_cpu_percent": 75.0,
                    "max_memory_usage_mb": 512,
                    "max_worker_threads": 500,
                    "min_quality_score": 60.0
                }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_audio_metrics_lookup() {
        let state = test_state();
        state.monitor.start_audio_monitoring("s1", "u1");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/audio/{session_id}", web::get().to(get_audio_metrics)),
        )
        .await;

        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/audio/s1").to_request()).await;
        assert!(resp.status().is_success());

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/audio/ghost").to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_optimizer_update_endpoint() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/optimizer", web::put().to(update_optimizer)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/optimizer")
                .set_json(json!({ "batch_size": 4, "compression_enabled": false }))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        assert_eq!(state.optimizer.config().batch_size, 4);
        assert!(!state.optimizer.config().compression_enabled);
    }
}
