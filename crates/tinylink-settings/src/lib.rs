//! tinylink Settings Crate
//!
//! Handles the configuration record consumed by the controller: serial
//! link parameters, flow-control limits, and status reporting cadence.

pub mod config;
pub mod error;

pub use config::{Config, ConnectionSettings, ControllerSettings, Parity};
pub use error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
