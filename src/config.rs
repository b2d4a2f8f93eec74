use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("can't parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level service configuration. Every field has a default, so an empty
/// JSON object is a valid config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    pub instance: InstanceConfig,
}

/// Settings shared by every CPU instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Image key an instance loads when it is reset.
    pub boot_image: String,
    /// PC seeded on reset; all other registers start at zero.
    pub entry_point: u16,
    pub input_poll_ms: u64,
    pub max_disassembly: usize,
    pub io: IoMap,
}

/// Addresses of the memory-mapped peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoMap {
    pub input_buffer: u16,
    pub input_length: u16,
    pub output: u16,
    pub lock: u16,
    pub alarm: u16,
    pub temperature: u16,
    pub airflow: u16,
    pub debug_buffer: u16,
    pub debug_length: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            instance: InstanceConfig::default(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            boot_image: "boot".to_string(),
            entry_point: 0x4400,
            input_poll_ms: 500,
            max_disassembly: 100,
            io: IoMap::default(),
        }
    }
}

impl Default for IoMap {
    fn default() -> Self {
        IoMap {
            input_buffer: 0x0280,
            input_length: 0x0282,
            output: 0x05CE,
            lock: 0x0220,
            alarm: 0x0222,
            temperature: 0x0224,
            airflow: 0x0226,
            debug_buffer: 0x0260,
            debug_length: 0x0262,
        }
    }
}

impl InstanceConfig {
    pub fn input_poll_interval(&self) -> Duration {
        Duration::from_millis(self.input_poll_ms)
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Config, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
