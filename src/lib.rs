//! # tinylink
//!
//! Sender and controller stack for TinyG-class motion controllers.
//!
//! ## Architecture
//!
//! tinylink is organized as a workspace with multiple crates:
//!
//! 1. **tinylink-core** - Errors, axis and run-state model, controller events
//! 2. **tinylink-settings** - Configuration loading, saving and validation
//! 3. **tinylink-communication** - Serial transport and the TinyG protocol engine
//! 4. **tinylink** - Command-line binary and the glue in this crate
//!
//! ## Features
//!
//! - **Flow control**: lines are released against the firmware planner's free
//!   slots and an unacknowledged-request ceiling
//! - **Per-line progress**: every queued line reports when it was sent,
//!   acknowledged, started executing and retired
//! - **Motion helpers**: homing, absolute moves and probing with automatic
//!   detection of the firmware's probe coordinate convention

use std::path::Path;

pub use tinylink_communication::firmware;

pub use tinylink_core::{
    Axis, AxisValues, ConnectionError, ControllerError, ControllerEvent, Error, EventDispatcher,
    GcodeLine, MachineRunState, ProtocolError, Result, Units,
};

pub use tinylink_communication::{
    list_ports, CommsDiagnostics, ConnectionParams, Instruction, InstructionHandle, Priority,
    ProbeOutcome, SerialPortInfo, Stage, StatusSnapshot, TinyGController,
};

pub use tinylink_settings::{Config, ConnectionSettings, ControllerSettings, Parity};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output with pretty formatting
/// - RUST_LOG environment variable support, `info` by default
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Load the configuration to run with.
///
/// An explicit path must exist. Without one, the default location is used if
/// a file is there, otherwise built-in defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Ok(Config::load_from_file(path)?);
    }
    match Config::default_path() {
        Ok(default) if default.exists() => Ok(Config::load_from_file(&default)?),
        Ok(_) => Ok(Config::default()),
        Err(e) => {
            tracing::debug!("No config directory, using defaults: {}", e);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_explicit_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tinylink.toml");
        let mut config = Config::default();
        config.connection.port = "/dev/ttyACM3".to_string();
        config.controller.status_report_interval_ms = 100;
        config.save_to_file(&path).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.connection.port, "/dev/ttyACM3");
        assert_eq!(loaded.controller.status_report_interval_ms, 100);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
        assert!(!BUILD_DATE.is_empty());
    }
}
