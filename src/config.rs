//! JSON configuration: one entry per exposed device listener.

use anyhow::{bail, Context, Result};
use log::{info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_DATA_BITS: u8 = 8;
pub const DEFAULT_STOP_BITS: u8 = 1;
pub const DEFAULT_PARITY: &str = "N";

/// One exposed device: a TCP listen port bridged to a serial port path or a
/// `host:port` network-attached device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    /// TCP port to accept clients on. 0 binds an ephemeral port.
    pub listen_port: u16,
    /// Serial port path (`/dev/ttyUSB0`, `COM3`) or `host:port` for a
    /// network-attached device.
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
}

const fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

const fn default_data_bits() -> u8 {
    DEFAULT_DATA_BITS
}

const fn default_stop_bits() -> u8 {
    DEFAULT_STOP_BITS
}

fn default_parity() -> String {
    DEFAULT_PARITY.to_string()
}

impl ListenerConfig {
    /// New listener entry with the default serial parameters (9600 8N1).
    #[must_use]
    pub fn new(name: &str, listen_port: u16, device: &str) -> Self {
        Self {
            name: name.to_string(),
            listen_port,
            device: device.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: DEFAULT_STOP_BITS,
            parity: DEFAULT_PARITY.to_string(),
        }
    }

    /// True when the device is a `host:port` network address rather than a
    /// serial port path.
    #[must_use]
    pub fn is_network_device(&self) -> bool {
        self.device.contains(':') && !self.device.starts_with('/')
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("listener name must not be empty");
        }
        if self.device.is_empty() {
            bail!("device must not be empty");
        }
        if !(5..=8).contains(&self.data_bits) {
            bail!("unsupported data bits: {} (supported: 5-8)", self.data_bits);
        }
        if !matches!(self.stop_bits, 1 | 2) {
            bail!("unsupported stop bits: {} (supported: 1 or 2)", self.stop_bits);
        }
        if !matches!(self.parity.as_str(), "N" | "O" | "E") {
            bail!("unsupported parity: {} (supported: N/O/E)", self.parity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Config {
    /// Load a config file. A missing file is an empty config, not an error.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load, falling back to the default config on any error.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Config {
        match Self::load(path) {
            Ok(config) => {
                info!("loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("failed to load config: {e:#}, using defaults");
                Config::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create config directory {}", dir.display())
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        info!("config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for listener in &self.listeners {
            listener
                .validate()
                .with_context(|| format!("listener '{}'", listener.name))?;
        }
        for (i, a) in self.listeners.iter().enumerate() {
            for b in &self.listeners[i + 1..] {
                if a.name == b.name {
                    bail!("duplicate listener name '{}'", a.name);
                }
                if a.listen_port != 0 && a.listen_port == b.listen_port {
                    bail!(
                        "listeners '{}' and '{}' share listen port {}",
                        a.name,
                        b.name,
                        a.listen_port
                    );
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn find_listener_by_port(&self, port: u16) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.listen_port == port)
    }

    #[must_use]
    pub fn find_listener_by_name(&self, name: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.name == name)
    }

    pub fn add_listener(&mut self, listener: ListenerConfig) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, name: &str) {
        self.listeners.retain(|l| l.name != name);
    }
}
