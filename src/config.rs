//! Configuration for the pairing service.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::observability::ObservabilityConfig;
use crate::pairing::PairingConfig;
use crate::protocol::{ProtocolBackend, ProtocolConfig};

/// Main configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub pairing: PairingConfig,
    pub protocol: ProtocolConfig,
    pub keepalive: KeepAliveConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let gateway = GatewayConfig::from_env()?;
        let keepalive = KeepAliveConfig::from_env(gateway.port)?;

        Ok(Self {
            pairing: PairingConfig::from_env()?,
            protocol: ProtocolConfig::from_env()?,
            observability: ObservabilityConfig::from_env()?,
            gateway,
            keepalive,
        })
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// `/code` requests allowed per window.
    pub rate_limit: u32,
    pub rate_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            rate_limit: 30,
            rate_window: Duration::from_secs(60),
        }
    }
}

impl GatewayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: optional_env("HOST")?.unwrap_or(defaults.host),
            port: optional_env("PORT")?
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "PORT".to_string(),
                    message: format!("must be a valid port number: {e}"),
                })?
                .unwrap_or(defaults.port),
            rate_limit: parse_optional_env("PAIRING_RATE_LIMIT", defaults.rate_limit)?,
            rate_window: Duration::from_secs(parse_optional_env(
                "PAIRING_RATE_WINDOW_SECS",
                defaults.rate_window.as_secs(),
            )?),
        })
    }

    /// `host:port` string for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PairingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            session_dir: optional_env("SESSION_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.session_dir),
            settle_delay: Duration::from_millis(parse_optional_env(
                "PAIRING_SETTLE_DELAY_MS",
                defaults.settle_delay.as_millis() as u64,
            )?),
            request_timeout: Duration::from_secs(parse_optional_env(
                "PAIRING_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            closed_retention: Duration::from_secs(parse_optional_env(
                "PAIRING_CLOSED_RETENTION_SECS",
                defaults.closed_retention.as_secs(),
            )?),
        })
    }
}

impl ProtocolConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let backend: ProtocolBackend = optional_env("PROTOCOL_BACKEND")?
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();
        Ok(Self { backend })
    }
}

impl ObservabilityConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            backend: optional_env("OBSERVABILITY_BACKEND")?.unwrap_or_else(|| "log".to_string()),
        })
    }
}

/// Self-ping configuration for hosts that idle out quiet services.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    /// Base URL; `/health` is appended.
    pub url: String,
    pub interval: Duration,
}

impl KeepAliveConfig {
    fn from_env(port: u16) -> Result<Self, ConfigError> {
        let explicit = match optional_env("KEEPALIVE_URL")? {
            Some(url) => Some(url),
            None => optional_env("RENDER_EXTERNAL_URL")?,
        };
        Ok(Self {
            enabled: optional_env("KEEPALIVE_ENABLED")?
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "KEEPALIVE_ENABLED".to_string(),
                    message: format!("must be 'true' or 'false': {e}"),
                })?
                .unwrap_or(true),
            url: keepalive_url(explicit, port),
            interval: Duration::from_secs(parse_optional_env("KEEPALIVE_INTERVAL_SECS", 840)?),
        })
    }
}

/// The configured public URL without a trailing slash, or the local gateway.
fn keepalive_url(explicit: Option<String>, port: u16) -> String {
    match explicit {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => format!("http://localhost:{port}"),
    }
}

// Helper functions

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
