//! # Administrative HTTP Surface
//!
//! Read/write endpoints over the session registry and the performance
//! telemetry: session stats and logs, connection quality, timeout and
//! monitoring configuration, thresholds, per-session metrics, pool stats and
//! optimizer parameters.

pub mod monitoring;
pub mod performance;

pub use monitoring::*;
pub use performance::*;
