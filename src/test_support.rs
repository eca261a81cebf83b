//! Shared fixtures for unit tests.

use crate::config::AppConfig;
use crate::state::AppState;

/// Fully wired application state on default configuration.
pub fn test_state() -> AppState {
    AppState::from_config(AppConfig::default())
}
