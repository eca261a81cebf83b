//! # Audio Pipeline
//!
//! Validates, encodes and decodes the audio payloads that flow through the
//! realtime relay. Everything in here operates on raw byte buffers; actual
//! codec work (WebM/Opus decoding) is delegated to the upstream endpoint.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//!
//! ## Recovery Policy:
//! Validation, decode and format errors are logged and swallowed so a single
//! bad chunk never tears down a live conversation. Unsupported-format and
//! configuration errors are fatal for the triggering call and propagate.

pub mod pipeline;

pub use pipeline::{AudioError, AudioFormat, AudioPipeline, AudioSettings};
