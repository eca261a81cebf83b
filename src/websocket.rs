//! # Realtime Relay WebSocket
//!
//! Client-facing half of the relay. Each connection to `/ws/realtime` is one
//! actor: the actor owns the client socket, a handle to the upstream
//! connection, and the session id it was admitted under. A dedicated fan-out
//! task per upstream connection reads responses and feeds them back into the
//! actor's mailbox; the two directions share nothing but their sockets.
//!
//! ## Protocol:
//! - **Client → Server**: JSON frames dispatched on the required `"type"`
//!   field: `configure_session`, `audio_data {audio}`, `commit_audio`,
//!   `test`. A missing or unknown type earns an `error` reply; the
//!   connection stays open.
//! - **Server → Client**: `connection_established`, `session_configured`,
//!   `audio_response`, `text_response`, `response_complete`, `error`,
//!   `echo`, `warning`.
//!
//! ## Degraded mode:
//! When the upstream dial fails the session is NOT torn down: the actor
//! sends a warning and answers `commit_audio` with a scripted
//! `text_response` until the client disconnects.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::collaborators::SessionRecord;
use crate::error::AppError;
use crate::recovery::RelayFailure;
use crate::relay::protocol::{
    parse_upstream_event, ClientMessage, ServerMessage, UpstreamEvent,
};
use crate::relay::upstream::{UpstreamHandle, UpstreamReader};
use crate::session::EndReason;
use crate::state::AppState;
use crate::telemetry::{Direction, QueuedMessage};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);
const UPSTREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);
const OUTBOUND_DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Scripted reply served while the upstream endpoint is unreachable.
const FALLBACK_REPLY: &str = "I received your audio, but the realtime AI service is \
currently unavailable. This session is running in offline test mode; please verify \
the upstream configuration and try again.";

/// One client connection to the relay.
pub struct RealtimeSocket {
    state: web::Data<AppState>,
    session_id: String,
    user_id: String,
    upstream: Option<UpstreamHandle>,
    fallback: bool,
    last_heartbeat: Instant,
    last_ping_sent: Option<Instant>,
    end_reason: EndReason,
}

impl RealtimeSocket {
    fn new(state: web::Data<AppState>, session_id: String, user_id: String) -> Self {
        Self {
            state,
            session_id,
            user_id,
            upstream: None,
            fallback: false,
            last_heartbeat: Instant::now(),
            last_ping_sent: None,
            end_reason: EndReason::Completed,
        }
    }

    /// Push a server message through the outbound queue and write whatever
    /// the optimizer releases.
    fn deliver(&self, message: ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let priority = message.priority();
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize server message");
                return;
            }
        };

        let batch = self
            .state
            .optimizer
            .queue_message(&self.session_id, payload, priority);
        self.write_batch(batch, ctx);
    }

    fn write_batch(&self, batch: Vec<QueuedMessage>, ctx: &mut ws::WebsocketContext<Self>) {
        for queued in batch {
            let size = queued.payload.len();
            if let Some(compressed) = self.state.optimizer.maybe_compress(queued.payload.as_bytes())
            {
                ctx.binary(compressed);
            } else {
                ctx.text(queued.payload);
            }
            self.state.monitor.record_websocket_message(
                &self.session_id,
                Direction::Sent,
                size,
                Duration::ZERO,
                false,
            );
        }
    }

    fn send_error(&self, code: &str, message: &str, ctx: &mut ws::WebsocketContext<Self>) {
        warn!(session_id = %self.session_id, code, message, "relay error sent to client");
        self.deliver(ServerMessage::error(code, message), ctx);
    }

    /// Forward a decoded client audio chunk upstream from a detached task.
    fn handle_audio_data(&self, audio: String, ctx: &mut ws::WebsocketContext<Self>) {
        self.state.registry.update_session_activity(&self.session_id);
        self.state.monitor.record_websocket_message(
            &self.session_id,
            Direction::Received,
            audio.len(),
            Duration::ZERO,
            false,
        );

        if self.fallback {
            debug!(session_id = %self.session_id, "dropping audio chunk in fallback mode");
            return;
        }

        let Some(handle) = self.upstream.clone() else {
            self.send_error(
                "upstream_not_ready",
                "The upstream connection is still being established.",
                ctx,
            );
            return;
        };

        let state = self.state.clone();
        let session_id = self.session_id.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            let raw = match state.audio.decode_base64(&audio) {
                Ok(raw) => raw,
                Err(err) => {
                    state.registry.record_session_error(&session_id);
                    // Recoverable decode problems skip the chunk; fatal ones
                    // are surfaced to the client
                    if let Err(fatal) = state.audio.recover(err, "audio_data") {
                        addr.do_send(Outbound(ServerMessage::error(
                            "audio_decode_failed",
                            &fatal.to_string(),
                        )));
                    }
                    return;
                }
            };

            let chunk = match state.audio.process_realtime_chunk(&raw) {
                Ok(chunk) => chunk,
                Err(err) => {
                    state.registry.record_session_error(&session_id);
                    state
                        .registry
                        .update_connection_metric(&session_id, 0.0, 0, true);
                    if let Err(fatal) = state.audio.recover(err, "audio_data") {
                        addr.do_send(Outbound(ServerMessage::error(
                            "audio_validation_failed",
                            &fatal.to_string(),
                        )));
                    }
                    return;
                }
            };

            // 16kHz mono PCM16 is 32 bytes per millisecond
            state.registry.record_audio(&session_id, chunk.len() as u64 / 32);
            state
                .registry
                .update_connection_metric(&session_id, 0.0, chunk.len() as u64, false);

            if let Err(e) = state.upstream.send_audio(&handle, &session_id, &chunk).await {
                state.registry.record_session_error(&session_id);
                state
                    .registry
                    .update_connection_metric(&session_id, 0.0, 0, true);
                addr.do_send(Outbound(ServerMessage::error(
                    "audio_send_failed",
                    &e.to_string(),
                )));
            }
        });
    }

    fn handle_commit_audio(&self, ctx: &mut ws::WebsocketContext<Self>) {
        self.state.registry.update_session_activity(&self.session_id);

        if self.fallback {
            self.deliver(ServerMessage::text_response(FALLBACK_REPLY.to_string()), ctx);
            self.deliver(ServerMessage::response_complete(), ctx);
            return;
        }

        let Some(handle) = self.upstream.clone() else {
            self.send_error(
                "upstream_not_ready",
                "The upstream connection is still being established.",
                ctx,
            );
            return;
        };

        let state = self.state.clone();
        let session_id = self.session_id.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            if let Err(e) = state.upstream.commit_audio(&handle).await {
                state.registry.record_session_error(&session_id);
                addr.do_send(Outbound(ServerMessage::error(
                    "audio_commit_failed",
                    &e.to_string(),
                )));
            }
        });
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(ServerMessage);

#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamReady(UpstreamHandle);

#[derive(Message)]
#[rtype(result = "()")]
struct EnterFallback {
    user_message: String,
}

#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamGone {
    code: &'static str,
    user_message: String,
}

impl Actor for RealtimeSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, user_id = %self.user_id, "relay connection started");

        // Liveness pings with latency sampling into the connection metric
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if act.last_heartbeat.elapsed() > CLIENT_LIVENESS_TIMEOUT {
                warn!(session_id = %act.session_id, "client heartbeat timeout, closing");
                act.end_reason = EndReason::Timeout;
                ctx.stop();
                return;
            }
            act.last_ping_sent = Some(Instant::now());
            ctx.ping(b"");
        });

        // Batched low-priority messages drain on the optimizer's timeout
        ctx.run_interval(OUTBOUND_DRAIN_INTERVAL, |act, ctx| {
            let due = act.state.optimizer.drain_due(&act.session_id);
            if !due.is_empty() {
                act.write_batch(due, ctx);
            }
        });

        self.deliver(ServerMessage::connection_established(&self.user_id), ctx);

        // Dial upstream off the actor thread; results come back as messages
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            match state.upstream.connect().await {
                Ok((handle, reader)) => {
                    if let Err(e) = state.upstream.configure_session(&handle).await {
                        error!(error = %e, "upstream session configuration failed");
                        addr.do_send(EnterFallback {
                            user_message:
                                "The AI service could not be configured; running in test mode."
                                    .to_string(),
                        });
                        return;
                    }
                    addr.do_send(UpstreamReady(handle.clone()));
                    run_upstream_fanout(reader, addr, state, session_id, handle).await;
                }
                Err(e) => {
                    warn!(error = %e, "upstream unreachable, degrading to fallback mode");
                    addr.do_send(EnterFallback {
                        user_message: format!(
                            "The AI service is temporarily unavailable, running in test mode: {}",
                            e
                        ),
                    });
                }
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "relay connection stopped");

        let state = self.state.clone();
        state.registry.end_session(&self.session_id, self.end_reason);
        state.monitor.remove_session(&self.session_id);
        state.pool.release(&self.session_id);
        state.optimizer.cleanup_session(&self.session_id);

        if let Some(session) = state.registry.session(&self.session_id) {
            let record = SessionRecord {
                session_id: session.id,
                user_id: session.user_id,
                message_count: session.message_count,
                audio_duration_ms: session.audio_duration_ms,
                error_count: session.error_count,
                end_reason: self.end_reason.as_str().to_string(),
            };
            // Fire-and-forget; the sink must never block teardown
            tokio::spawn(async move {
                state.history.write(record);
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RealtimeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match ClientMessage::parse(&text) {
                Ok(ClientMessage::ConfigureSession) => {
                    self.state.registry.update_session_activity(&self.session_id);
                    self.deliver(ServerMessage::session_configured(), ctx);
                }
                Ok(ClientMessage::AudioData { audio }) => {
                    self.handle_audio_data(audio, ctx);
                }
                Ok(ClientMessage::CommitAudio) => {
                    self.handle_commit_audio(ctx);
                }
                Ok(ClientMessage::Test { extra }) => {
                    self.state.registry.update_session_activity(&self.session_id);
                    self.deliver(ServerMessage::echo(extra), ctx);
                }
                Err(parse_err) => {
                    // Bad frames never close the connection
                    self.state.registry.record_session_error(&self.session_id);
                    self.send_error(parse_err.code(), &parse_err.message(), ctx);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(
                    "binary_not_supported",
                    "This relay expects JSON text frames.",
                    ctx,
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
                if let Some(sent) = self.last_ping_sent.take() {
                    let latency_ms = sent.elapsed().as_secs_f64() * 1000.0;
                    self.state.registry.update_connection_metric(
                        &self.session_id,
                        latency_ms,
                        0,
                        false,
                    );
                }
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "client closed relay connection");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "websocket protocol error");
                self.end_reason = EndReason::Error;
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for RealtimeSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        self.deliver(msg.0, ctx);
    }
}

impl Handler<UpstreamReady> for RealtimeSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamReady, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "upstream connection ready");
        self.upstream = Some(msg.0);
        self.fallback = false;
    }
}

impl Handler<EnterFallback> for RealtimeSocket {
    type Result = ();

    fn handle(&mut self, msg: EnterFallback, ctx: &mut Self::Context) {
        self.fallback = true;
        self.upstream = None;
        self.deliver(ServerMessage::warning(&msg.user_message), ctx);
    }
}

impl Handler<UpstreamGone> for RealtimeSocket {
    type Result = ();

    fn handle(&mut self, msg: UpstreamGone, ctx: &mut Self::Context) {
        self.state.registry.record_session_error(&self.session_id);
        self.send_error(msg.code, &msg.user_message, ctx);
        // Keep the client session alive in degraded mode
        self.fallback = true;
        self.upstream = None;
    }
}

/// Response fan-out: one task per upstream connection.
///
/// Reads under a 60s deadline refreshed every iteration, translates upstream
/// events into client messages, and reports any panic through the governor
/// before the loop terminates.
async fn run_upstream_fanout(
    mut reader: UpstreamReader,
    addr: Addr<RealtimeSocket>,
    state: web::Data<AppState>,
    session_id: String,
    handle: UpstreamHandle,
) {
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let endpoint = handle.endpoint().to_string();
    let loop_state = state.clone();
    let loop_addr = addr.clone();
    let loop_session = session_id.clone();

    let fanout = async move {
        loop {
            let frame = match tokio::time::timeout(UPSTREAM_READ_TIMEOUT, reader.next()).await {
                Err(_) => {
                    let report = loop_state.governor.report(&RelayFailure::Connection {
                        endpoint: endpoint.clone(),
                        reason: "upstream read deadline exceeded".to_string(),
                        attempts: loop_state.governor.connection_attempts(&endpoint),
                    });
                    loop_addr.do_send(UpstreamGone {
                        code: "connection_error",
                        user_message: report.user_message,
                    });
                    break;
                }
                Ok(None) => {
                    let report = loop_state.governor.report(&RelayFailure::Connection {
                        endpoint: endpoint.clone(),
                        reason: "upstream closed the connection".to_string(),
                        attempts: loop_state.governor.connection_attempts(&endpoint),
                    });
                    loop_addr.do_send(UpstreamGone {
                        code: "connection_error",
                        user_message: report.user_message,
                    });
                    break;
                }
                Ok(Some(Err(e))) => {
                    let report = loop_state.governor.report(&RelayFailure::Connection {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                        attempts: loop_state.governor.connection_attempts(&endpoint),
                    });
                    loop_addr.do_send(UpstreamGone {
                        code: "connection_error",
                        user_message: report.user_message,
                    });
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let text = match frame {
                WsMessage::Text(text) => text,
                WsMessage::Close(reason) => {
                    debug!(?reason, "upstream sent close frame");
                    let report = loop_state.governor.report(&RelayFailure::Connection {
                        endpoint: endpoint.clone(),
                        reason: "upstream closed the connection".to_string(),
                        attempts: loop_state.governor.connection_attempts(&endpoint),
                    });
                    loop_addr.do_send(UpstreamGone {
                        code: "connection_error",
                        user_message: report.user_message,
                    });
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => {
                    warn!(?other, "unexpected non-text frame from upstream");
                    continue;
                }
            };

            let event = match parse_upstream_event(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "undecodable frame from upstream, dropping");
                    continue;
                }
            };

            match event {
                UpstreamEvent::ResponseAudioDelta { delta } => {
                    loop_state.registry.update_connection_metric(
                        &loop_session,
                        0.0,
                        delta.len() as u64,
                        false,
                    );
                    loop_addr.do_send(Outbound(ServerMessage::audio_response(delta)));
                }
                UpstreamEvent::ResponseTextDelta { delta } => {
                    loop_addr.do_send(Outbound(ServerMessage::text_response(delta)));
                }
                UpstreamEvent::ResponseDone => {
                    loop_addr.do_send(Outbound(ServerMessage::response_complete()));
                }
                UpstreamEvent::Error { error } => {
                    let report = loop_state.governor.report(&RelayFailure::UpstreamApi {
                        endpoint: endpoint.clone(),
                        code: error.code.unwrap_or_else(|| "UNKNOWN_ERROR".to_string()),
                        message: error
                            .message
                            .unwrap_or_else(|| "unknown upstream error".to_string()),
                    });
                    loop_state.registry.record_session_error(&loop_session);
                    loop_addr.do_send(Outbound(ServerMessage::error(
                        "upstream_api_error",
                        &report.user_message,
                    )));
                }
                UpstreamEvent::SessionCreated
                | UpstreamEvent::SessionUpdated
                | UpstreamEvent::InputAudioBufferCommitted
                | UpstreamEvent::InputAudioBufferCleared
                | UpstreamEvent::ConversationItemCreated
                | UpstreamEvent::ResponseCreated
                | UpstreamEvent::ResponseOutputItemAdded
                | UpstreamEvent::ResponseContentPartAdded
                | UpstreamEvent::ResponseAudioDone
                | UpstreamEvent::ResponseTextDone => {
                    debug!(session_id = %loop_session, "upstream administrative ack");
                }
                UpstreamEvent::Unknown { event_type, .. } => {
                    warn!(event_type = %event_type, "unhandled upstream event type, dropping");
                }
            }
        }
    };

    // A panic in the fan-out must surface as a reported error, not a silent
    // task death
    if let Err(panic) = AssertUnwindSafe(fanout).catch_unwind().await {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());

        let report = state.governor.report(&RelayFailure::UpstreamApi {
            endpoint: handle.endpoint().to_string(),
            code: "FANOUT_PANIC".to_string(),
            message: format!("response fan-out panicked: {}", detail),
        });
        addr.do_send(UpstreamGone {
            code: "upstream_api_error",
            user_message: report.user_message,
        });
    }

    debug!(session_id = %session_id, "upstream fan-out terminated");
}

/// HTTP entrypoint: authenticate, admit a session, upgrade to WebSocket.
///
/// Admission runs before the upgrade so a full registry answers with a clean
/// HTTP 503 instead of an aborted socket.
pub async fn realtime_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));
    let token = query.get("token").cloned().unwrap_or_default();

    let identity = state
        .token_validator
        .validate(&token)
        .map_err(AppError::from)?;

    let client_ip = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();
    let user_agent = req
        .headers()
        .get(actix_web::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    info!(user_id = %identity.user_id, client_ip = %client_ip, "relay connection request");

    let session = state
        .registry
        .start_session(&identity.user_id, &identity.email, &client_ip, &user_agent)
        .map_err(AppError::from)?;

    state
        .monitor
        .start_audio_monitoring(&session.id, &identity.user_id);
    state.monitor.start_websocket_monitoring(&session.id);
    state
        .registry
        .start_connection_monitoring(&session.id, &identity.user_id);
    state.optimizer.register_session(&session.id);
    state.pool.acquire(&session.id, &identity.user_id);

    let socket = RealtimeSocket::new(state.clone(), session.id.clone(), identity.user_id);
    match ws::start(socket, &req, stream) {
        Ok(response) => Ok(response),
        Err(e) => {
            // Upgrade failed after admission; roll the session back
            state.registry.end_session(&session.id, EndReason::Error);
            state.monitor.remove_session(&session.id);
            state.pool.release(&session.id);
            state.optimizer.cleanup_session(&session.id);
            Err(e)
        }
    }
}
