//! # Voice Relay Backend - Main Application Entry Point
//!
//! Brokers real-time voice conversations between WebSocket clients and a
//! hosted realtime speech endpoint, with session admission, connection
//! telemetry and privacy-preserving access logging.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared application state; every component is constructed
//!   here once and injected, never reached through globals
//! - **session**: session registry, admission control, access logs
//! - **relay / websocket**: the realtime duplex relay itself
//! - **audio**: payload validation and framing
//! - **recovery**: failure classification, retries, circuit breaker
//! - **telemetry**: latency metrics, thresholds/alerts, pool, optimizer
//! - **handlers / health / middleware**: the administrative HTTP surface
//!
//! Background work (timeout sweep, registry cleanup, pool cleanup, system
//! metrics collection) runs as detached tasks that all watch one shutdown
//! channel owned by `main`, so a signal stops every loop before the server
//! exits.

mod audio;
mod collaborators;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod recovery;
mod relay;
mod session;
mod state;
mod telemetry;
#[cfg(test)]
mod test_support;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;
use state::AppState;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        max_sessions = config.sessions.max_sessions,
        "configuration loaded"
    );
    if config.upstream.endpoint.is_empty() {
        warn!("no upstream endpoint configured; relay sessions will run in fallback mode");
    }

    let app_state = AppState::from_config(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // One shutdown scope owns every background task lifetime
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_background_tasks(app_state.clone(), shutdown_rx.clone());
    setup_signal_handlers(shutdown_tx);

    info!(bind_addr = %bind_addr, "starting HTTP server");

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .service(
                        web::scope("/monitoring")
                            .route("/sessions/stats", web::get().to(handlers::get_session_stats))
                            .route(
                                "/sessions/active",
                                web::get().to(handlers::get_active_sessions),
                            )
                            .route(
                                "/sessions/{session_id}/quality",
                                web::get().to(handlers::get_connection_quality),
                            )
                            .route("/access-logs", web::get().to(handlers::get_access_logs))
                            .route(
                                "/session-timeout",
                                web::put().to(handlers::update_session_timeout),
                            )
                            .route(
                                "/check-timeouts",
                                web::post().to(handlers::check_session_timeouts),
                            )
                            .route("/enable", web::post().to(handlers::enable_monitoring))
                            .route("/disable", web::post().to(handlers::disable_monitoring))
                            .route("/privacy", web::get().to(handlers::get_privacy_status)),
                    )
                    .service(
                        web::scope("/performance")
                            .route(
                                "/audio/{session_id}",
                                web::get().to(handlers::get_audio_metrics),
                            )
                            .route(
                                "/websocket/{session_id}",
                                web::get().to(handlers::get_websocket_metrics),
                            )
                            .route("/resources", web::get().to(handlers::get_resource_metrics))
                            .route("/pool", web::get().to(handlers::get_pool_stats))
                            .route(
                                "/overview",
                                web::get().to(handlers::get_performance_overview),
                            )
                            .route("/thresholds", web::get().to(handlers::get_thresholds))
                            .route("/thresholds", web::put().to(handlers::set_thresholds))
                            .route("/optimizer", web::put().to(handlers::update_optimizer))
                            .route(
                                "/enable",
                                web::post().to(handlers::enable_performance_monitoring),
                            )
                            .route(
                                "/disable",
                                web::post().to(handlers::disable_performance_monitoring),
                            ),
                    ),
            )
            .route("/ws/realtime", web::get().to(websocket::realtime_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);
    let mut shutdown_watch = shutdown_rx;

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown(&mut shutdown_watch) => {
            info!("shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Detached maintenance loops: session timeout sweep + registry cleanup,
/// connection pool cleanup, and the system metrics collector. Each exits when
/// the shutdown channel flips.
fn spawn_background_tasks(state: AppState, shutdown: watch::Receiver<bool>) {
    // Registry sweep: timeouts, retention cleanup and the cascade into
    // telemetry and the pool
    {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.registry.cleanup_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let timed_out = state.registry.check_session_timeout();
                        for event in &timed_out {
                            state.monitor.remove_session(&event.session_id);
                            state.pool.release(&event.session_id);
                            state.optimizer.cleanup_session(&event.session_id);
                        }
                        if !timed_out.is_empty() {
                            info!(count = timed_out.len(), "timed out idle sessions");
                        }

                        let purged = state.registry.cleanup();
                        for session_id in &purged {
                            state.monitor.remove_session(session_id);
                            state.pool.discard(session_id);
                            state.optimizer.cleanup_session(session_id);
                        }

                        state.monitor.cleanup_expired(Duration::from_secs(3600));
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("registry sweep stopped");
        });
    }

    // Idle pooled connections
    {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        let interval =
            Duration::from_secs(state.get_config().telemetry.pool_cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.pool.cleanup_stale();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("pool cleanup stopped");
        });
    }

    // System metrics: collect a snapshot and hand it to the monitor for
    // threshold checks. The collector never calls the monitor itself.
    {
        let state = state;
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.collector.interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = state.collector.collect();
                        state.monitor.record_resource_sample(&snapshot);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("system metrics collector stopped");
        });
    }
}

fn setup_signal_handlers(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }

        let _ = shutdown_tx.send(true);
    });
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
