//! Session registry administration: stats, active sessions, access logs,
//! connection quality, timeout configuration and the manual sweep trigger.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AccessLogQuery {
    pub limit: Option<usize>,
    pub page: Option<usize>,
}

pub async fn get_session_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": state.registry.session_stats(),
    }))
}

pub async fn get_active_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.registry.active_sessions();
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": {
            "count": sessions.len(),
            "sessions": sessions,
        },
    }))
}

pub async fn get_access_logs(
    state: web::Data<AppState>,
    query: web::Query<AccessLogQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let page = query.page.unwrap_or(0);
    let logs = state.registry.access_logs(limit, page);

    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": {
            "count": logs.len(),
            "limit": limit,
            "page": page,
            "total": state.registry.access_log_count(),
            "logs": logs,
        },
    }))
}

pub async fn get_connection_quality(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let metric = state
        .registry
        .connection_quality(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("no connection metric for {}", session_id)))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "data": metric,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SessionTimeoutRequest {
    pub timeout_minutes: u64,
}

pub async fn update_session_timeout(
    state: web::Data<AppState>,
    body: web::Json<SessionTimeoutRequest>,
) -> AppResult<HttpResponse> {
    if body.timeout_minutes == 0 || body.timeout_minutes > 24 * 60 {
        return Err(AppError::ValidationError(
            "timeout_minutes must be between 1 and 1440".to_string(),
        ));
    }

    state
        .registry
        .set_session_timeout(Duration::from_secs(body.timeout_minutes * 60));

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "session timeout updated",
        "data": { "timeout_minutes": body.timeout_minutes },
    })))
}

/// Manual trigger for the inactivity sweep; the background loop runs the
/// same path on its interval.
pub async fn check_session_timeouts(state: web::Data<AppState>) -> HttpResponse {
    let events = state.registry.check_session_timeout();
    for event in &events {
        state.monitor.remove_session(&event.session_id);
        state.pool.release(&event.session_id);
        state.optimizer.cleanup_session(&event.session_id);
    }

    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": {
            "count": events.len(),
            "timeout_events": events,
        },
    }))
}

pub async fn enable_monitoring(state: web::Data<AppState>) -> HttpResponse {
    state.registry.enable_monitoring();
    HttpResponse::Ok().json(json!({ "status": "success", "message": "monitoring enabled" }))
}

pub async fn disable_monitoring(state: web::Data<AppState>) -> HttpResponse {
    state.registry.disable_monitoring();
    HttpResponse::Ok().json(json!({ "status": "success", "message": "monitoring disabled" }))
}

pub async fn get_privacy_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": {
            "privacy_mode_enabled": state.registry.privacy_mode(),
            "audio_data_protection": "enabled",
            "data_retention_policy": "no_audio_storage",
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_session_stats_endpoint() {
        let state = test_state();
        state
            .registry
            .start_session("u1", "u1@example.com", "10.0.0.1", "test")
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/stats", web::get().to(get_session_stats)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/stats").to_request()).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["active_sessions"], 1);
        assert_eq!(body["data"]["max_sessions"], 100);
    }

    #[actix_web::test]
    async fn test_connection_quality_not_found() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/quality/{session_id}", web::get().to(get_connection_quality)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/quality/ghost").to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_session_timeout_validation() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/timeout", web::put().to(update_session_timeout)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/timeout")
                .set_json(json!({ "timeout_minutes": 0 }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/timeout")
                .set_json(json!({ "timeout_minutes": 15 }))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        assert_eq!(
            state.registry.session_timeout(),
            Duration::from_secs(15 * 60)
        );
    }

    #[actix_web::test]
    async fn test_access_logs_pagination_params() {
        let state = test_state();
        for _ in 0..3 {
            state
                .registry
                .log_access("u1", "", "", "read", "/r", "GET", "10.0.0.1", "curl", 200, 1, None);
        }

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/logs", web::get().to(get_access_logs)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/logs?limit=2&page=0").to_request(),
        )
        .await;
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["count"], 2);
        assert_eq!(body["data"]["total"], 3);
    }
}
