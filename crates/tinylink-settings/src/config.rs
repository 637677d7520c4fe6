//! Configuration for tinylink
//!
//! Provides configuration file handling and validation.
//! Supports JSON and TOML file formats, with a default location in the
//! platform config directory.
//!
//! Configuration is organized into two sections:
//! - Connection settings (port, baud, framing, reconnect behaviour)
//! - Controller settings (flow-control limits, planner size, reporting)

use crate::error::{ConfigError, SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl std::fmt::Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Even => write!(f, "even"),
            Self::Odd => write!(f, "odd"),
        }
    }
}

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port path, e.g. `/dev/ttyUSB0`
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Hardware (RTS/CTS) flow control
    pub rts_cts: bool,
    /// Software (XON/XOFF) flow control
    pub xon_xoff: bool,
    /// Reconnect automatically after the link drops
    pub auto_reconnect: bool,
    /// Delay before a reconnect attempt
    pub reconnect_delay_ms: u64,
    /// Read timeout used by the serial reader thread
    pub read_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            rts_cts: true,
            xon_xoff: false,
            auto_reconnect: true,
            reconnect_delay_ms: 5000,
            read_timeout_ms: 50,
        }
    }
}

/// Controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Ceiling on sent-but-unacknowledged instructions
    pub max_unacked_requests: usize,
    /// Below this many unacked lines the receive buffer is assumed to have room
    pub rx_low_watermark: usize,
    /// Planner buffer size in slots; raised if the firmware reports more free
    pub planner_capacity: usize,
    /// Status report interval requested from the firmware
    pub status_report_interval_ms: u64,
    /// Age after which a status report is considered stale
    pub status_stale_ms: u64,
    /// Decimal digits used when encoding numbers on the wire
    pub number_precision: usize,
    /// Feed rate used by `probe` when none is given
    pub probe_default_feed: f64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_unacked_requests: 32,
            rx_low_watermark: 4,
            planner_capacity: 28,
            status_report_interval_ms: 250,
            status_stale_ms: 500,
            number_precision: 5,
            probe_default_feed: 25.0,
        }
    }
}

/// Complete configuration record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial link settings
    pub connection: ConnectionSettings,
    /// Flow control and reporting settings
    pub controller: ControllerSettings,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location (`<config dir>/tinylink/config.toml`)
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("tinylink").join("config.toml"))
            .ok_or(SettingsError::NoConfigDirectory)
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = match extension(path) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                )
                .into())
            }
        };

        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match extension(path) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                )
                .into())
            }
        };

        let write_error = |source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        std::fs::write(path, content).map_err(write_error)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.baud_rate == 0 {
            return Err(out_of_range("connection.baud_rate", conn.baud_rate));
        }
        if !(5..=8).contains(&conn.data_bits) {
            return Err(out_of_range("connection.data_bits", conn.data_bits));
        }
        if !(1..=2).contains(&conn.stop_bits) {
            return Err(out_of_range("connection.stop_bits", conn.stop_bits));
        }

        let ctl = &self.controller;
        if ctl.max_unacked_requests == 0 {
            return Err(out_of_range(
                "controller.max_unacked_requests",
                ctl.max_unacked_requests,
            ));
        }
        if ctl.planner_capacity == 0 {
            return Err(out_of_range(
                "controller.planner_capacity",
                ctl.planner_capacity,
            ));
        }
        if ctl.rx_low_watermark >= ctl.max_unacked_requests {
            return Err(ConfigError::Inconsistent(format!(
                "rx_low_watermark ({}) must be below max_unacked_requests ({})",
                ctl.rx_low_watermark, ctl.max_unacked_requests
            )));
        }
        if ctl.number_precision > 10 {
            return Err(out_of_range(
                "controller.number_precision",
                ctl.number_precision,
            ));
        }
        if ctl.probe_default_feed <= 0.0 {
            return Err(out_of_range(
                "controller.probe_default_feed",
                ctl.probe_default_feed,
            ));
        }

        Ok(())
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn out_of_range(key: &str, value: impl std::fmt::Display) -> ConfigError {
    ConfigError::ValueOutOfRange {
        key: key.to_string(),
        value: value.to_string(),
    }
}
