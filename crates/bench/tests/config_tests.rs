//! Integration tests for benchmark configuration files
//!
//! Covers:
//! - Saving and loading through the filesystem
//! - Full and partial files
//! - Rejected values and malformed TOML

use bench::config::{BenchConfig, TransferMode};
use bench::firmware::TestType;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
log_level = "debug"

[device]
vid = 0x1234
pid = 0x5678
interface = 1
alt_setting = 2
endpoint = 3
no_test_select = true

[test]
test_type = "write"
mode = "async"
refresh_ms = 500
timeout_ms = 250
retry = 5
buffer_size = 8192
buffer_count = 8
iso_packet_size = 1024
verify = true
verify_details = true
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("bench.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, FULL_CONFIG);

    let config = BenchConfig::load(Some(path)).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.device.vid, 0x1234);
    assert_eq!(config.device.pid, 0x5678);
    assert_eq!(config.device.interface, 1);
    assert_eq!(config.device.alt_setting, 2);
    assert_eq!(config.device.endpoint, 3);
    assert!(config.device.no_test_select);
    assert_eq!(config.test.test_type, TestType::Write);
    assert_eq!(config.test.mode, TransferMode::Async);
    assert_eq!(config.test.refresh(), Duration::from_millis(500));
    assert_eq!(config.test.timeout(), Duration::from_millis(250));
    assert_eq!(config.test.retry, 5);
    assert_eq!(config.test.buffer_size, 8192);
    assert_eq!(config.test.buffer_count, 8);
    assert_eq!(config.test.iso_packet_size, 1024);
    assert!(config.test.verify);
    assert!(config.test.verify_details);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("bench.toml");

    let mut config = BenchConfig::default();
    config.test.test_type = TestType::Read;
    config.test.buffer_count = 4;
    config.device.vid = 0x04b4;
    config.save(&path).unwrap();

    let loaded = BenchConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.test.test_type, TestType::Read);
    assert_eq!(loaded.test.buffer_count, 4);
    assert_eq!(loaded.device.vid, 0x04b4);
    assert_eq!(loaded.test.effective_mode(), TransferMode::Async);
}

#[test]
fn test_empty_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");

    let config = BenchConfig::load(Some(path)).unwrap();
    assert_eq!(config.device.vid, 0x0666);
    assert_eq!(config.test.test_type, TestType::Loop);
    assert_eq!(config.test.mode, TransferMode::Sync);
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();

    let path = write_config(&dir, "[test]\nbuffer_count = 11\n");
    assert!(BenchConfig::load(Some(path)).is_err());

    let path = write_config(&dir, "[test]\nbuffer_size = 0\n");
    assert!(BenchConfig::load(Some(path)).is_err());

    let path = write_config(&dir, "[test]\nrefresh_ms = 0\n");
    assert!(BenchConfig::load(Some(path)).is_err());

    let path = write_config(&dir, "[test]\ntest_type = \"sideways\"\n");
    assert!(BenchConfig::load(Some(path)).is_err());
}

#[test]
fn test_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[test\nbuffer_size = ");
    let err = BenchConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = BenchConfig::load(Some(dir.path().join("absent.toml"))).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to read config file"));
}

#[test]
fn test_expand_path() {
    assert_eq!(
        BenchConfig::expand_path("/etc/usb-bench/bench.toml"),
        std::path::PathBuf::from("/etc/usb-bench/bench.toml")
    );
    if let Some(home) = dirs::home_dir() {
        assert_eq!(BenchConfig::expand_path("~/bench.toml"), home.join("bench.toml"));
    }
}
