/*!
 * Configuration management for scanflow.
 *
 * This module provides functionality to load, validate, and access
 * configuration settings for the scanner backend.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::types::ProtoId;

/// Core configuration for the scanner backend
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Statically configured devices
    #[serde(default)]
    pub devices: Vec<StaticDevice>,

    /// Device listing configuration
    #[serde(default)]
    pub listing: ListingConfig,

    /// HTTP retry configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A statically configured device: probed at startup without discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDevice {
    /// Device name, as shown to the frontend
    pub name: String,

    /// Absolute HTTP URI of the device endpoint
    pub uri: String,

    /// Protocol spoken at the endpoint
    #[serde(default = "default_proto")]
    pub proto: ProtoId,
}

/// Device listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingConfig {
    /// Use the network name instead of the hardware model in listings
    #[serde(default)]
    pub model_is_netname: bool,

    /// Max time to wait until the device table is ready, in milliseconds
    #[serde(default = "default_table_ready_timeout_ms")]
    pub table_ready_timeout_ms: u64,
}

/// HTTP retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// How many retry attempts to perform on a transient (503-class)
    /// reply before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Pause between retries, in milliseconds
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_proto() -> ProtoId {
    ProtoId::Escl
}

fn default_table_ready_timeout_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_pause_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            model_is_netname: false,
            table_ready_timeout_ms: default_table_ready_timeout_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_pause_ms: default_retry_pause_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with `SCANFLOW_`-prefixed
    /// environment variables layered on top
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let cfg = ConfigLib::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("SCANFLOW").separator("__"))
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        debug!(
            "configuration loaded: {} static device(s)",
            config.devices.len()
        );
        Ok(config)
    }

    /// Max time to wait until the device table is ready
    pub fn table_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.listing.table_ready_timeout_ms)
    }

    /// Pause between HTTP retries
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.http.retry_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.devices.is_empty());
        assert!(!config.listing.model_is_netname);
        assert_eq!(config.http.retry_attempts, 10);
        assert_eq!(config.table_ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry_pause(), Duration::from_secs(1));
    }

    #[test]
    fn test_static_device_deserialize() {
        let dev: StaticDevice = serde_json::from_str(
            r#"{"name": "Kyocera MFP", "uri": "http://192.168.1.102:9095/eSCL"}"#,
        )
        .unwrap();
        assert_eq!(dev.proto, ProtoId::Escl);
        assert_eq!(dev.name, "Kyocera MFP");
    }
}
