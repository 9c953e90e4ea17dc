//! Runtime configuration, loadable from a `strom.yaml` manifest.
//!
//! ```yaml
//! server:
//!   host: 0.0.0.0
//!   port: 5000
//! coordinator:
//!   token_ttl_seconds: 86400
//!   event_retention: 500
//!   broker:
//!     topic: load
//!     kafka_brokers: 127.0.0.1:9092
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{events::DEFAULT_EVENT_RETENTION, notifier::DEFAULT_LISTENER_BUFFER};

/// Default manifest file name
pub const MANIFEST_FILE_NAME: &str = "strom.yaml";

/// Server configuration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (0 for auto-assign)
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Topic receiving asynchronous loads
    pub topic: String,
    /// Undelivered messages the in-process broker holds before refusing more
    pub capacity: usize,
    /// Largest encoded payload accepted for hand-off
    pub max_message_bytes: usize,
    /// Kafka bootstrap servers; the in-process broker is used when unset
    pub kafka_brokers: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: "load".to_string(),
            capacity: 1024,
            max_message_bytes: 1024 * 1024,
            kafka_brokers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lifetime of a stream definition; unset keeps definitions forever
    pub token_ttl_seconds: Option<u64>,
    /// Events retained per stream for the read path
    pub event_retention: usize,
    /// Events buffered per listener before it starts missing events
    pub listener_buffer: usize,
    pub broker: BrokerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            token_ttl_seconds: None,
            event_retention: DEFAULT_EVENT_RETENTION,
            listener_buffer: DEFAULT_LISTENER_BUFFER,
            broker: BrokerConfig::default(),
        }
    }
}

/// Strom manifest file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub server: ServerOptions,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{} not found at {}", MANIFEST_FILE_NAME, .0.display())]
    FileNotFound(std::path::PathBuf),
    #[error("Failed to read {}: {}", .0.display(), .1)]
    ReadError(std::path::PathBuf, std::io::Error),
    #[error("Failed to parse {}: {}", .0.display(), .1)]
    ParseError(std::path::PathBuf, serde_yml::Error),
}

impl Manifest {
    /// Load manifest from the specified file path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;

        serde_yml::from_str(&content).map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))
    }
}
