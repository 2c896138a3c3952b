//! Configuration management for answer capture.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub observer: ObserverConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub relay: RelayClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether capture is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Tag the matched elements must have; empty matches any tag
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Style class marking answer blocks
    #[serde(default = "default_class_name")]
    pub class_name: String,

    /// Identifier prefix marking answer blocks
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Trimmed text must be longer than this many characters
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            tag: default_tag(),
            class_name: default_class_name(),
            id_prefix: default_id_prefix(),
            min_chars: default_min_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Leading characters that make up a fingerprint
    #[serde(default = "default_fingerprint_chars")]
    pub fingerprint_chars: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fingerprint_chars: default_fingerprint_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Wait after a relevant change before extracting
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
}

impl ObserverConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Processing endpoint receiving one POST per new unit
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Value of the `source` field in every payload
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            source: default_source(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayClientConfig {
    /// Forward new units to the history relay
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Relay Unix socket
    #[serde(default = "default_relay_socket")]
    pub socket_path: PathBuf,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_relay_socket(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tag() -> String {
    "div".to_string()
}

fn default_class_name() -> String {
    "prose".to_string()
}

fn default_id_prefix() -> String {
    "markdown-content-".to_string()
}

fn default_min_chars() -> usize {
    50
}

fn default_fingerprint_chars() -> usize {
    200
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_endpoint() -> String {
    "http://localhost:8001/summarize".to_string()
}

fn default_source() -> String {
    "perplexity".to_string()
}

fn default_relay_socket() -> PathBuf {
    PathBuf::from("/tmp/answer-capture-relay.sock")
}

impl Config {
    /// Parse a TOML document; absent sections and keys take their defaults
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Read `path`, using defaults when it is missing or unusable
    pub fn load_or_default(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Cannot read {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };

        Self::from_toml(&contents).unwrap_or_else(|e| {
            warn!("{} in {}, using defaults", e, path.display());
            Self::default()
        })
    }

    /// `<config_dir>/answer-capture/config.toml`
    pub fn default_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("answer-capture").join("config.toml")
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Wrote configuration to {}", path.display());
        Ok(())
    }
}
