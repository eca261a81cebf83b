//! Upstream realtime endpoint connection.
//!
//! The socket is split after the handshake: a writer task owns the sink and
//! serializes every outbound command under a 5s write deadline, acking each
//! write back through a oneshot channel; the read half is handed to the
//! response fan-out loop. Once the loops are running, closing the socket is
//! the only cancellation path.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::audio::AudioPipeline;
use crate::config::UpstreamConfig;
use crate::recovery::ErrorGovernor;
use crate::relay::protocol::{RealtimeSessionConfig, UpstreamCommand};
use crate::telemetry::PerformanceMonitor;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read half of the upstream socket, consumed by the fan-out loop.
pub type UpstreamReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

type UpstreamSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Dial or handshake failed; the caller degrades to fallback mode
    ConnectionFailed(String),
    /// An `input_audio_buffer.append` write failed or timed out
    AudioSendFailed(String),
    /// Any other upstream write failed or timed out
    SendFailed(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ConnectionFailed(msg) => write!(f, "upstream connection failed: {}", msg),
            RelayError::AudioSendFailed(msg) => write!(f, "audio send failed: {}", msg),
            RelayError::SendFailed(msg) => write!(f, "upstream send failed: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

struct WriteRequest {
    command: UpstreamCommand,
    ack: oneshot::Sender<Result<(), String>>,
}

/// Handle to one live upstream connection.
///
/// Cloneable; all clones feed the same writer task. Dropping every clone
/// closes the channel and ends the writer.
#[derive(Clone)]
pub struct UpstreamHandle {
    tx: mpsc::Sender<WriteRequest>,
    endpoint: String,
}

impl UpstreamHandle {
    /// Serialize a command to the socket and wait for the write to finish.
    async fn send(&self, command: UpstreamCommand) -> Result<(), String> {
        let kind = command.kind();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                command,
                ack: ack_tx,
            })
            .await
            .map_err(|_| format!("upstream writer gone while sending {}", kind))?;

        match tokio::time::timeout(WRITE_TIMEOUT, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(format!("upstream writer dropped ack for {}", kind)),
            Err(_) => Err(format!("write deadline exceeded for {}", kind)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Dials and drives the upstream realtime endpoint.
pub struct UpstreamClient {
    config: UpstreamConfig,
    governor: Arc<ErrorGovernor>,
    monitor: Arc<PerformanceMonitor>,
    audio: Arc<AudioPipeline>,
}

impl UpstreamClient {
    pub fn new(
        config: UpstreamConfig,
        governor: Arc<ErrorGovernor>,
        monitor: Arc<PerformanceMonitor>,
        audio: Arc<AudioPipeline>,
    ) -> Self {
        Self {
            config,
            governor,
            monitor,
            audio,
        }
    }

    /// Build the wss URL from the configured endpoint.
    fn websocket_url(&self) -> String {
        let host = self
            .config
            .endpoint
            .trim_end_matches('/')
            .trim_start_matches("https://")
            .trim_start_matches("wss://")
            .trim_start_matches("http://");
        format!(
            "wss://{}/openai/realtime?api-version={}&deployment={}",
            host, self.config.api_version, self.config.deployment
        )
    }

    /// Dial and handshake the upstream endpoint.
    ///
    /// On success the attempt counter for the endpoint resets and the caller
    /// receives a write handle plus the read half for the fan-out loop. On
    /// failure the governor records the attempt and the caller is expected to
    /// degrade to fallback mode rather than close the client connection.
    pub async fn connect(&self) -> Result<(UpstreamHandle, UpstreamReader), RelayError> {
        let url = self.websocket_url();
        info!(endpoint = %url, "connecting to upstream realtime endpoint");

        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| self.connection_failure(&url, &format!("invalid endpoint: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(
            "api-key",
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|e| self.connection_failure(&url, &format!("invalid api key: {}", e)))?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (stream, response) =
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request)).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => {
                    return Err(
                        self.connection_failure(&url, &format!("websocket handshake failed: {}", e))
                    );
                }
                Err(_) => {
                    return Err(self.connection_failure(&url, "handshake timed out"));
                }
            };
        debug!(status = %response.status(), "upstream handshake complete");

        self.governor.reset_connection_attempts(&url);
        info!(endpoint = %url, "connected to upstream realtime endpoint");

        let (sink, reader) = stream.split();
        let (tx, rx) = mpsc::channel::<WriteRequest>(64);
        tokio::spawn(run_writer(sink, rx));

        Ok((
            UpstreamHandle {
                tx,
                endpoint: url,
            },
            reader,
        ))
    }

    fn connection_failure(&self, endpoint: &str, reason: &str) -> RelayError {
        let (report, _should_retry) = self.governor.record_connection_failure(endpoint, reason);
        RelayError::ConnectionFailed(report.user_message)
    }

    /// Send the one-shot session configuration; must precede any audio.
    pub async fn configure_session(&self, handle: &UpstreamHandle) -> Result<(), RelayError> {
        handle
            .send(UpstreamCommand::SessionUpdate {
                session: RealtimeSessionConfig::default(),
            })
            .await
            .map_err(RelayError::SendFailed)?;

        info!("upstream session configured");
        Ok(())
    }

    /// Validate, encode and forward one audio chunk.
    ///
    /// Recoverable pipeline errors are logged and the chunk is forwarded
    /// anyway; fatal ones abort the send. The processing-start,
    /// transmission-start and write-complete instants feed the audio-latency
    /// telemetry for the session.
    pub async fn send_audio(
        &self,
        handle: &UpstreamHandle,
        session_id: &str,
        audio_data: &[u8],
    ) -> Result<(), RelayError> {
        if audio_data.is_empty() {
            return Err(RelayError::AudioSendFailed("audio data is empty".into()));
        }

        let processing_start = Instant::now();

        if let Err(err) = self.audio.validate_format(audio_data) {
            self.audio
                .recover(err, "send_audio")
                .map_err(|fatal| RelayError::AudioSendFailed(fatal.to_string()))?;
        }

        let encoded = self.audio.encode_base64(audio_data);
        debug!(
            raw_bytes = audio_data.len(),
            base64_len = encoded.len(),
            "forwarding audio chunk upstream"
        );

        let transmission_start = Instant::now();
        handle
            .send(UpstreamCommand::InputAudioBufferAppend { audio: encoded })
            .await
            .map_err(|e| {
                warn!(error = %e, "audio append write failed");
                RelayError::AudioSendFailed(e)
            })?;

        self.monitor
            .record_audio_latency(session_id, processing_start, transmission_start);
        Ok(())
    }

    /// Mark end-of-utterance with an explicit buffer commit.
    pub async fn commit_audio(&self, handle: &UpstreamHandle) -> Result<(), RelayError> {
        handle
            .send(UpstreamCommand::InputAudioBufferCommit)
            .await
            .map_err(RelayError::AudioSendFailed)?;

        debug!("audio buffer committed upstream");
        Ok(())
    }
}

/// Writer task: sole owner of the sink, enforcing the write deadline.
async fn run_writer(mut sink: UpstreamSink, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        let payload = match serde_json::to_string(&request.command) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = request.ack.send(Err(format!("serialization failed: {}", e)));
                continue;
            }
        };

        let result =
            match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(payload))).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("socket write failed: {}", e)),
                Err(_) => Err("socket write timed out".to_string()),
            };

        let failed = result.is_err();
        let _ = request.ack.send(result);

        if failed {
            // A dead socket fails every subsequent write; stop draining
            error!("upstream writer stopping after failed write");
            break;
        }
    }

    let _ = sink.close().await;
    debug!("upstream writer finished");
}
