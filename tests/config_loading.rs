//! Configuration loading from TOML and `FLYSCAN_` environment overrides.

use std::time::Duration;

use flyscan::config::FlyscanConfig;
use serial_test::serial;
use tempfile::TempDir;

const TOML: &str = r#"
[application]
name = "flyscan-test"
log_level = "debug"

[acquisition]
root_path = "/tmp/flyscan-test"
watchdog = "90s"

[sampling]
rounding_quantum = 1000

[[detectors]]
name = "apb_stream"
prefix = "XF:08IDB-CT{PBA:1}:"
host = "10.8.0.19"
"#;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("flyscan.toml");
    std::fs::write(&path, TOML).unwrap();
    path
}

#[test]
#[serial]
fn test_load_from_toml() {
    let dir = TempDir::new().unwrap();
    let config = FlyscanConfig::load_from(write_config(&dir)).unwrap();

    assert_eq!(config.application.name, "flyscan-test");
    assert_eq!(config.application.log_format, "pretty");
    assert_eq!(config.acquisition.watchdog, Duration::from_secs(90));
    assert_eq!(config.sampling.rounding_quantum, 1000);
    assert_eq!(config.sampling.lut_clock_hz, 16_000.0);
    assert_eq!(config.transfer.remote_txt_path, "/home/Save/FAstreamSettings.txt");
    assert_eq!(config.primary_detector().unwrap().host, "10.8.0.19");
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_env_overrides_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir);

    std::env::set_var("FLYSCAN_ACQUISITION__WATCHDOG", "10m");
    std::env::set_var("FLYSCAN_TRANSFER__USER", "xf08id");
    let config = FlyscanConfig::load_from(&path);
    std::env::remove_var("FLYSCAN_ACQUISITION__WATCHDOG");
    std::env::remove_var("FLYSCAN_TRANSFER__USER");

    let config = config.unwrap();
    assert_eq!(config.acquisition.watchdog, Duration::from_secs(600));
    assert_eq!(config.transfer.user, "xf08id");
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = FlyscanConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.acquisition.watchdog, Duration::from_secs(300));
    assert!(config.detectors.is_empty());
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_invalid_duration_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir);

    std::env::set_var("FLYSCAN_ACQUISITION__WATCHDOG", "soon");
    let result = FlyscanConfig::load_from(&path);
    std::env::remove_var("FLYSCAN_ACQUISITION__WATCHDOG");
    assert!(result.is_err());
}
