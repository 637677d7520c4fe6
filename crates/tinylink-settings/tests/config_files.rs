//! Tests for loading and saving config files

use tinylink_settings::{Config, ConfigError, Parity, SettingsError};

#[test]
fn test_toml_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.connection.port = "/dev/ttyUSB3".to_string();
    config.connection.parity = Parity::Odd;
    config.controller.max_unacked_requests = 16;

    config.save_to_file(&path).unwrap();
    let loaded = Config::load_from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_json_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let mut config = Config::default();
    config.controller.status_report_interval_ms = 100;
    config.save_to_file(&path).unwrap();

    let loaded = Config::load_from_file(&path).unwrap();
    assert_eq!(loaded.controller.status_report_interval_ms, 100);
}

#[test]
fn test_unknown_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");

    let err = Config::default().save_to_file(&path).unwrap_err();
    assert!(matches!(
        err,
        SettingsError::Config(ConfigError::UnsupportedFormat(_))
    ));
}

#[test]
fn test_invalid_file_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[controller]\nmax_unacked_requests = 0\n").unwrap();

    let err = Config::load_from_file(&path).unwrap_err();
    assert!(matches!(
        err,
        SettingsError::Config(ConfigError::ValueOutOfRange { .. })
    ));
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = Config::load_from_file(&path).unwrap_err();
    assert!(matches!(&err, SettingsError::Read { path: p, .. } if *p == path));
    assert!(err.to_string().contains("absent.toml"));
}
