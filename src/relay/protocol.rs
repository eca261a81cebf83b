//! Message vocabularies for both sides of the relay.
//!
//! Client and upstream frames are JSON objects discriminated by a `"type"`
//! field. Client frames are parsed by peeking the discriminator first so a
//! missing or unknown type can be answered with a structured error instead of
//! a connection teardown; upstream events keep a raw fallback variant so
//! unknown types can be logged and dropped without losing the payload.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames the client may send over the relay socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "configure_session")]
    ConfigureSession,

    #[serde(rename = "audio_data")]
    AudioData {
        /// Base64-encoded PCM16 payload
        audio: String,
    },

    #[serde(rename = "commit_audio")]
    CommitAudio,

    #[serde(rename = "test")]
    Test {
        /// Everything else in the frame, echoed back verbatim
        #[serde(flatten)]
        extra: Value,
    },
}

/// Why a client frame failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientParseError {
    /// Frame is not a JSON object
    Invalid(String),
    /// Frame has no `"type"` field
    MissingType,
    /// Discriminator names no known message
    UnknownType(String),
}

impl ClientParseError {
    /// Error code sent back to the client.
    pub fn code(&self) -> &'static str {
        match self {
            ClientParseError::Invalid(_) => "invalid_json",
            ClientParseError::MissingType => "missing_message_type",
            ClientParseError::UnknownType(_) => "unknown_message_type",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ClientParseError::Invalid(detail) => format!("invalid JSON message: {}", detail),
            ClientParseError::MissingType => "message is missing the \"type\" field".to_string(),
            ClientParseError::UnknownType(t) => format!("unknown message type: {}", t),
        }
    }
}

impl ClientMessage {
    /// Parse a text frame, peeking the `"type"` discriminator first.
    pub fn parse(text: &str) -> Result<Self, ClientParseError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ClientParseError::Invalid(e.to_string()))?;

        let Some(message_type) = value.get("type").and_then(Value::as_str) else {
            return Err(ClientParseError::MissingType);
        };

        match message_type {
            "configure_session" | "audio_data" | "commit_audio" | "test" => {
                serde_json::from_value(value).map_err(|e| ClientParseError::Invalid(e.to_string()))
            }
            other => Err(ClientParseError::UnknownType(other.to_string())),
        }
    }
}

/// Frames the server sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection_established")]
    ConnectionEstablished {
        user_id: String,
        status: String,
        timestamp: i64,
    },

    #[serde(rename = "session_configured")]
    SessionConfigured { status: String, timestamp: i64 },

    #[serde(rename = "audio_response")]
    AudioResponse { audio: String, timestamp: i64 },

    #[serde(rename = "text_response")]
    TextResponse { text: String, timestamp: i64 },

    #[serde(rename = "response_complete")]
    ResponseComplete { timestamp: i64 },

    #[serde(rename = "error")]
    Error {
        error: String,
        message: String,
        timestamp: i64,
    },

    #[serde(rename = "echo")]
    Echo { original: Value, timestamp: i64 },

    #[serde(rename = "warning")]
    Warning { message: String, timestamp: i64 },
}

impl ServerMessage {
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn connection_established(user_id: &str) -> Self {
        ServerMessage::ConnectionEstablished {
            user_id: user_id.to_string(),
            status: "connected".to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn session_configured() -> Self {
        ServerMessage::SessionConfigured {
            status: "success".to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn audio_response(audio: String) -> Self {
        ServerMessage::AudioResponse {
            audio,
            timestamp: Self::now(),
        }
    }

    pub fn text_response(text: String) -> Self {
        ServerMessage::TextResponse {
            text,
            timestamp: Self::now(),
        }
    }

    pub fn response_complete() -> Self {
        ServerMessage::ResponseComplete {
            timestamp: Self::now(),
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        ServerMessage::Error {
            error: code.to_string(),
            message: message.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn echo(original: Value) -> Self {
        ServerMessage::Echo {
            original,
            timestamp: Self::now(),
        }
    }

    pub fn warning(message: &str) -> Self {
        ServerMessage::Warning {
            message: message.to_string(),
            timestamp: Self::now(),
        }
    }

    /// Delivery priority for the outbound queue. Audio, errors and
    /// completion markers flush immediately; text deltas may batch.
    pub fn priority(&self) -> u8 {
        match self {
            ServerMessage::TextResponse { .. } => 2,
            _ => 1,
        }
    }
}

/// Voice-activity-detection settings sent in the session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    pub threshold: f64,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

/// The one-shot `session.update` body sent before any audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSessionConfig {
    pub model: String,
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: TurnDetection,
}

impl Default for RealtimeSessionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview".to_string(),
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: "You are a friendly assistant for spoken conversation. Keep replies concise."
                .to_string(),
            voice: "alloy".to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: InputAudioTranscription {
                model: "whisper-1".to_string(),
            },
            turn_detection: TurnDetection {
                detection_type: "server_vad".to_string(),
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 200,
            },
        }
    }
}

/// Commands sent to the upstream endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum UpstreamCommand {
    #[serde(rename = "session.update")]
    SessionUpdate { session: RealtimeSessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
}

impl UpstreamCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamCommand::SessionUpdate { .. } => "session.update",
            UpstreamCommand::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            UpstreamCommand::InputAudioBufferCommit => "input_audio_buffer.commit",
        }
    }
}

/// Body of an upstream `error` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Events received from the upstream endpoint.
///
/// Administrative acks carry no data the relay uses; they are logged and
/// dropped. Anything the enum does not know lands in `Unknown` with its raw
/// payload preserved.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamEvent {
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },

    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { delta: String },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: UpstreamErrorBody,
    },

    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted,

    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated,

    #[serde(rename = "response.created")]
    ResponseCreated,

    #[serde(rename = "response.output_item.added")]
    ResponseOutputItemAdded,

    #[serde(rename = "response.content_part.added")]
    ResponseContentPartAdded,

    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,

    #[serde(rename = "response.text.done")]
    ResponseTextDone,

    #[serde(skip)]
    Unknown { event_type: String, raw: Value },
}

/// Decode an upstream frame, falling back to [`UpstreamEvent::Unknown`] for
/// anything the vocabulary does not cover.
pub fn parse_upstream_event(text: &str) -> Result<UpstreamEvent, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match serde_json::from_value::<UpstreamEvent>(value.clone()) {
        Ok(event) => Ok(event),
        Err(_) => Ok(UpstreamEvent::Unknown {
            event_type,
            raw: value,
        }),
    }
}
