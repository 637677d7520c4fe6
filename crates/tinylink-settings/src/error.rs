//! Error types for the settings crate.
//!
//! `SettingsError` covers reading and writing config files; `ConfigError`
//! covers values that parse but can't be used.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or saving a config file.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file or its directory could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The platform has no per-user configuration directory.
    #[error("No configuration directory on this platform")]
    NoConfigDirectory,

    /// The file is not valid JSON for a config.
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// The file is not valid TOML for a config.
    #[error("Invalid TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The config could not be encoded as TOML.
    #[error("Could not encode TOML config: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    /// The values in the file are unusable.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Errors in configuration values.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    /// Only `.json` and `.toml` files are understood.
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A value is outside its valid range.
    #[error("Value out of range for '{key}': {value}")]
    ValueOutOfRange { key: String, value: String },

    /// Two settings contradict each other.
    #[error("Inconsistent settings: {0}")]
    Inconsistent(String),
}

impl From<SettingsError> for tinylink_core::Error {
    fn from(err: SettingsError) -> Self {
        tinylink_core::Error::other(err.to_string())
    }
}

/// Result of loading or saving settings.
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Result of validating settings.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_error_names_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/tinylink.toml"),
            source: io::Error::new(io::ErrorKind::NotFound, "file not found"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to read /etc/tinylink.toml: file not found"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ValueOutOfRange {
            key: "controller.max_unacked_requests".to_string(),
            value: "0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Value out of range for 'controller.max_unacked_requests': 0"
        );
    }

    #[test]
    fn test_conversion_to_core_error() {
        let settings_err: SettingsError = ConfigError::Inconsistent("watermark".to_string()).into();
        assert!(matches!(settings_err, SettingsError::Config(_)));

        let core_err: tinylink_core::Error = settings_err.into();
        assert!(core_err.to_string().contains("watermark"));
    }
}
