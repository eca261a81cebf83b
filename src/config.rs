//! # Configuration Management
//!
//! Loads application configuration from three sources, highest priority
//! last:
//! 1. Built-in defaults (the `Default` impls below)
//! 2. An optional `config.toml` next to the binary
//! 3. Environment variables with the `APP_` prefix
//!    (e.g. `APP_SERVER_HOST`, `APP_UPSTREAM_API_KEY`), plus the bare
//!    `HOST`/`PORT` overrides used by deployment platforms
//!
//! Every load path ends in `validate()` so the process never starts with a
//! configuration it cannot serve.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub sessions: SessionsConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream realtime endpoint credentials and addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_key: String,
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
}

/// Session admission and retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub max_sessions: usize,
    pub timeout_minutes: u64,
    pub cleanup_interval_secs: u64,
    pub log_retention_days: i64,
    pub privacy_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub collect_interval_secs: u64,
    pub pool_cleanup_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                api_key: String::new(),
                endpoint: String::new(),
                deployment: "gpt-4o-realtime-preview".to_string(),
                api_version: "2024-10-01-preview".to_string(),
            },
            sessions: SessionsConfig {
                max_sessions: 100,
                timeout_minutes: 30,
                cleanup_interval_secs: 300,
                log_retention_days: 30,
                privacy_mode: true,
            },
            telemetry: TelemetryConfig {
                collect_interval_secs: 30,
                pool_cleanup_interval_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms export these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port cannot be 0"));
        }

        if self.sessions.max_sessions == 0 {
            return Err(anyhow::anyhow!("max sessions must be greater than 0"));
        }

        if self.sessions.timeout_minutes == 0 {
            return Err(anyhow::anyhow!("session timeout must be greater than 0"));
        }

        if self.sessions.log_retention_days <= 0 {
            return Err(anyhow::anyhow!("log retention must be at least one day"));
        }

        if self.telemetry.collect_interval_secs == 0 {
            return Err(anyhow::anyhow!("telemetry collect interval must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.sessions.max_sessions, 100);
        assert_eq!(config.sessions.timeout_minutes, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.log_retention_days = 0;
        assert!(config.validate().is_err());
    }
}
