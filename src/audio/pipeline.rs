//! # Audio Validation and Framing
//!
//! The pipeline sits between the client socket and the upstream relay. It
//! decodes base64 payloads, enforces the PCM16 chunk-size policy and performs
//! best-effort container stripping for WAV/WebM input.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Smallest accepted chunk: 10ms of 16kHz mono PCM16.
pub const MIN_CHUNK_BYTES: usize = 320;

/// Largest accepted chunk: 10s of 16kHz mono PCM16.
pub const MAX_CHUNK_BYTES: usize = 320_000;

/// Nominal realtime chunk: 100ms of 16kHz mono PCM16.
pub const EXPECTED_CHUNK_BYTES: usize = 3_200;

/// Audio container formats the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Pcm16,
    Wav,
    Webm,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm16 => "pcm16",
            AudioFormat::Wav => "wav",
            AudioFormat::Webm => "webm",
        }
    }
}

/// Errors produced by the audio pipeline.
///
/// ## Recovery Semantics:
/// - `Validation`, `Decode`, `Format`: recoverable, see [`AudioPipeline::recover`]
/// - `UnsupportedFormat`, `Config`: fatal for the triggering call
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Payload failed a structural check (empty, too short, too long, odd length)
    Validation(String),

    /// Base64 decoding failed or produced nothing
    Decode(String),

    /// Container framing is broken (bad WAV header, truncated WebM)
    Format(String),

    /// Requested conversion pair is not implemented
    UnsupportedFormat { from: AudioFormat, to: AudioFormat },

    /// Pipeline configuration is invalid
    Config(String),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::Validation(msg) => write!(f, "audio validation error: {}", msg),
            AudioError::Decode(msg) => write!(f, "audio decode error: {}", msg),
            AudioError::Format(msg) => write!(f, "audio format error: {}", msg),
            AudioError::UnsupportedFormat { from, to } => write!(
                f,
                "unsupported audio conversion: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            AudioError::Config(msg) => write!(f, "audio config error: {}", msg),
        }
    }
}

impl std::error::Error for AudioError {}

impl AudioError {
    /// Whether processing may continue after logging this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AudioError::Validation(_) | AudioError::Decode(_) | AudioError::Format(_)
        )
    }
}

/// Expected input format, checked against every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

/// Audio validation and framing utilities shared by the relay.
///
/// The pipeline is cheap to clone and holds no connection state; one instance
/// is shared process-wide through `AppState`.
#[derive(Debug, Clone)]
pub struct AudioPipeline {
    settings: AudioSettings,
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPipeline {
    pub fn new() -> Self {
        Self {
            settings: AudioSettings::default(),
        }
    }

    /// Build a pipeline with explicit settings, rejecting unsupported values.
    pub fn with_settings(settings: AudioSettings) -> Result<Self, AudioError> {
        let mut pipeline = Self::new();
        pipeline.set_settings(settings)?;
        Ok(pipeline)
    }

    pub fn settings(&self) -> &AudioSettings {
        &self.settings
    }

    /// Replace the expected input format.
    ///
    /// Sample rate must be in (0, 48000], channels mono or stereo, bit depth
    /// fixed at 16. Violations are `Config` errors and propagate.
    pub fn set_settings(&mut self, settings: AudioSettings) -> Result<(), AudioError> {
        if settings.sample_rate == 0 || settings.sample_rate > 48_000 {
            return Err(AudioError::Config(format!(
                "sample rate {} is not supported",
                settings.sample_rate
            )));
        }
        if settings.channels == 0 || settings.channels > 2 {
            return Err(AudioError::Config(format!(
                "channel count {} is not supported",
                settings.channels
            )));
        }
        if settings.bit_depth != 16 {
            return Err(AudioError::Config(format!(
                "bit depth {} is not supported, only 16-bit PCM is accepted",
                settings.bit_depth
            )));
        }

        self.settings = settings;
        Ok(())
    }

    /// Decode a base64 audio payload into raw bytes.
    pub fn decode_base64(&self, audio: &str) -> Result<Vec<u8>, AudioError> {
        if audio.is_empty() {
            return Err(AudioError::Validation("audio data is empty".to_string()));
        }

        let decoded = BASE64
            .decode(audio)
            .map_err(|e| AudioError::Decode(format!("invalid base64 audio data: {}", e)))?;

        if decoded.is_empty() {
            return Err(AudioError::Decode(
                "base64 decoded successfully but produced no data".to_string(),
            ));
        }

        Ok(decoded)
    }

    /// Encode raw audio bytes as base64 for transport.
    pub fn encode_base64(&self, data: &[u8]) -> String {
        if data.is_empty() {
            warn!("encoding empty audio buffer to base64");
        }
        BASE64.encode(data)
    }

    /// Validate that a payload is plausible PCM16 within the chunk-size policy.
    pub fn validate_format(&self, data: &[u8]) -> Result<(), AudioError> {
        if data.is_empty() {
            return Err(AudioError::Validation("audio data is empty".to_string()));
        }

        // PCM16 samples are two bytes each
        if data.len() % 2 != 0 {
            return Err(AudioError::Format(format!(
                "audio length {} is not divisible by 2",
                data.len()
            )));
        }

        if data.len() < MIN_CHUNK_BYTES {
            return Err(AudioError::Validation(format!(
                "audio length {} is below the {} byte minimum (10ms)",
                data.len(),
                MIN_CHUNK_BYTES
            )));
        }

        if data.len() > MAX_CHUNK_BYTES {
            return Err(AudioError::Validation(format!(
                "audio length {} exceeds the {} byte maximum (10s)",
                data.len(),
                MAX_CHUNK_BYTES
            )));
        }

        Ok(())
    }

    /// Convert between container formats.
    ///
    /// Only conversions into PCM16 are implemented, and the lossy ones are
    /// header-stripping approximations: a production deployment needs a real
    /// decoder (ffmpeg/libopus) for WAV and WebM fidelity.
    pub fn convert_format(
        &self,
        input: &[u8],
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Vec<u8>, AudioError> {
        if input.is_empty() {
            return Err(AudioError::Validation(
                "cannot convert empty audio data".to_string(),
            ));
        }

        match (from, to) {
            (AudioFormat::Pcm16, AudioFormat::Pcm16) => Ok(input.to_vec()),
            (AudioFormat::Wav, AudioFormat::Pcm16) => self.convert_wav_to_pcm16(input),
            (AudioFormat::Webm, AudioFormat::Pcm16) => self.convert_webm_to_pcm16(input),
            (from, to) => Err(AudioError::UnsupportedFormat { from, to }),
        }
    }

    /// Strip the fixed 44-byte RIFF/WAVE header and return the PCM body.
    fn convert_wav_to_pcm16(&self, wav: &[u8]) -> Result<Vec<u8>, AudioError> {
        const WAV_HEADER_LEN: usize = 44;

        if wav.len() < WAV_HEADER_LEN {
            return Err(AudioError::Format(
                "WAV data too short to contain a valid header".to_string(),
            ));
        }

        if &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
            return Err(AudioError::Format(
                "missing RIFF/WAVE magic in WAV header".to_string(),
            ));
        }

        if wav.len() == WAV_HEADER_LEN {
            return Err(AudioError::Format(
                "WAV file contains a header but no audio data".to_string(),
            ));
        }

        // Assumes the canonical 44-byte header; chunked WAV files need a real parser
        warn!("WAV conversion strips a fixed 44-byte header; use a real decoder for production fidelity");
        Ok(self.ensure_pcm16(&wav[WAV_HEADER_LEN..]))
    }

    /// Treat a WebM payload as already-PCM after a minimum-size check.
    fn convert_webm_to_pcm16(&self, webm: &[u8]) -> Result<Vec<u8>, AudioError> {
        if webm.len() < 100 {
            return Err(AudioError::Format(
                "WebM data too short to be valid".to_string(),
            ));
        }

        warn!("WebM conversion is a passthrough stub; use a real decoder for production fidelity");
        Ok(self.ensure_pcm16(webm))
    }

    /// Truncate a trailing odd byte so the buffer holds whole PCM16 samples.
    fn ensure_pcm16(&self, data: &[u8]) -> Vec<u8> {
        if data.len() % 2 != 0 {
            warn!("truncating audio buffer by one byte to restore even sample alignment");
            data[..data.len() - 1].to_vec()
        } else {
            data.to_vec()
        }
    }

    /// Validate a realtime chunk and return a defensive copy.
    ///
    /// Deviation from the nominal ~3200-byte/100ms chunk size is logged but
    /// never fatal; callers keep streaming.
    pub fn process_realtime_chunk(&self, chunk: &[u8]) -> Result<Vec<u8>, AudioError> {
        self.validate_format(chunk)?;

        let expected = (self.settings.sample_rate as usize / 10) * 2;
        if chunk.len() > expected * 2 {
            warn!(
                actual = chunk.len(),
                expected, "audio chunk larger than the nominal 100ms frame"
            );
        } else if chunk.len() < expected / 2 {
            warn!(
                actual = chunk.len(),
                expected, "audio chunk smaller than the nominal 100ms frame"
            );
        }

        if !self.is_plausible_pcm16(chunk) {
            debug!("audio chunk is entirely silent, forwarding anyway");
        }

        Ok(chunk.to_vec())
    }

    /// Heuristic silence/corruption check over the sample values.
    pub fn is_plausible_pcm16(&self, data: &[u8]) -> bool {
        if data.is_empty() || data.len() % 2 != 0 {
            return false;
        }

        let samples = data.len() / 2;
        let mut all_zero = true;
        for i in 0..samples {
            if LittleEndian::read_i16(&data[i * 2..i * 2 + 2]) != 0 {
                all_zero = false;
                break;
            }
        }

        // Long runs of pure zeros usually mean a capture problem, not speech
        !(all_zero && data.len() > 1000)
    }

    /// Resolve a pipeline error according to the recovery policy.
    ///
    /// Recoverable errors are logged and swallowed ("continue processing");
    /// fatal ones are handed back to the caller.
    pub fn recover(&self, err: AudioError, context: &str) -> Result<(), AudioError> {
        if err.is_recoverable() {
            warn!(context, error = %err, "recovered from audio error, continuing");
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Generate a sine-wave PCM16 buffer, used by tests and the echo path.
    pub fn generate_test_tone(&self, duration_ms: u32, frequency: f64) -> Vec<u8> {
        let samples = (self.settings.sample_rate as usize * duration_ms as usize) / 1000;
        let mut data = vec![0u8; samples * 2];

        for i in 0..samples {
            let t = i as f64 / self.settings.sample_rate as f64;
            let sample = ((2.0 * std::f64::consts::PI * frequency * t).sin() * 16_383.0) as i16;
            LittleEndian::write_i16(&mut data[i * 2..i * 2 + 2], sample);
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_round_trip() {
        let pipeline = AudioPipeline::new();
        let original = pipeline.generate_test_tone(100, 440.0);

        let encoded = pipeline.encode_base64(&original);
        let decoded = pipeline.decode_base64(&encoded).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        let pipeline = AudioPipeline::new();

        assert!(matches!(
            pipeline.decode_base64(""),
            Err(AudioError::Validation(_))
        ));
        assert!(matches!(
            pipeline.decode_base64("not base64!!!"),
            Err(AudioError::Decode(_))
        ));
    }

    #[test]
    fn test_validate_format_bounds() {
        let pipeline = AudioPipeline::new();

        // Odd length
        assert!(pipeline.validate_format(&vec![0u8; 321]).is_err());
        // Below the 10ms floor
        assert!(pipeline.validate_format(&vec![0u8; 318]).is_err());
        // Exactly at the floor and ceiling
        assert!(pipeline.validate_format(&vec![0u8; MIN_CHUNK_BYTES]).is_ok());
        assert!(pipeline.validate_format(&vec![0u8; MAX_CHUNK_BYTES]).is_ok());
        // Above the 10s ceiling
        assert!(pipeline
            .validate_format(&vec![0u8; MAX_CHUNK_BYTES + 2])
            .is_err());
        // Everything even in between passes
        assert!(pipeline.validate_format(&vec![0u8; 4096]).is_ok());
    }

    #[test]
    fn test_wav_conversion_strips_header() {
        let pipeline = AudioPipeline::new();
        let body = pipeline.generate_test_tone(50, 440.0);

        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&[0u8; 4]);
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(&[0u8; 32]); // rest of the canonical header
        wav.extend_from_slice(&body);

        let pcm = pipeline
            .convert_format(&wav, AudioFormat::Wav, AudioFormat::Pcm16)
            .unwrap();
        assert_eq!(pcm, body);
    }

    #[test]
    fn test_wav_conversion_rejects_bad_magic() {
        let pipeline = AudioPipeline::new();
        let bogus = vec![0u8; 128];

        assert!(matches!(
            pipeline.convert_format(&bogus, AudioFormat::Wav, AudioFormat::Pcm16),
            Err(AudioError::Format(_))
        ));
    }

    #[test]
    fn test_unsupported_conversion_pair() {
        let pipeline = AudioPipeline::new();
        let data = vec![0u8; 512];

        let err = pipeline
            .convert_format(&data, AudioFormat::Pcm16, AudioFormat::Wav)
            .unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedFormat { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_realtime_chunk_returns_copy() {
        let pipeline = AudioPipeline::new();
        let chunk = pipeline.generate_test_tone(100, 220.0);
        assert_eq!(chunk.len(), EXPECTED_CHUNK_BYTES);

        let processed = pipeline.process_realtime_chunk(&chunk).unwrap();
        assert_eq!(processed, chunk);
        assert_ne!(processed.as_ptr(), chunk.as_ptr());
    }

    #[test]
    fn test_recovery_policy() {
        let pipeline = AudioPipeline::new();

        assert!(pipeline
            .recover(AudioError::Validation("short".into()), "test")
            .is_ok());
        assert!(pipeline
            .recover(AudioError::Decode("bad".into()), "test")
            .is_ok());
        assert!(pipeline
            .recover(AudioError::Format("odd".into()), "test")
            .is_ok());
        assert!(pipeline
            .recover(
                AudioError::UnsupportedFormat {
                    from: AudioFormat::Webm,
                    to: AudioFormat::Wav
                },
                "test"
            )
            .is_err());
        assert!(pipeline
            .recover(AudioError::Config("rate".into()), "test")
            .is_err());
    }

    #[test]
    fn test_settings_validation() {
        let mut pipeline = AudioPipeline::new();

        assert!(pipeline
            .set_settings(AudioSettings {
                sample_rate: 0,
                ..AudioSettings::default()
            })
            .is_err());
        assert!(pipeline
            .set_settings(AudioSettings {
                sample_rate: 96_000,
                ..AudioSettings::default()
            })
            .is_err());
        assert!(pipeline
            .set_settings(AudioSettings {
                channels: 3,
                ..AudioSettings::default()
            })
            .is_err());
        assert!(pipeline
            .set_settings(AudioSettings {
                bit_depth: 24,
                ..AudioSettings::default()
            })
            .is_err());
        assert!(pipeline
            .set_settings(AudioSettings {
                sample_rate: 24_000,
                channels: 2,
                bit_depth: 16,
            })
            .is_ok());
        assert_eq!(pipeline.settings().sample_rate, 24_000);
    }

    #[test]
    fn test_silence_heuristic() {
        let pipeline = AudioPipeline::new();

        let silent = vec![0u8; 2048];
        assert!(!pipeline.is_plausible_pcm16(&silent));

        let tone = pipeline.generate_test_tone(100, 440.0);
        assert!(pipeline.is_plausible_pcm16(&tone));
    }
}
