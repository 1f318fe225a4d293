//! Benchmark configuration management

use crate::firmware::TestType;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest number of transfers kept in flight per endpoint
pub const MAX_OUTSTANDING_TRANSFERS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub test: TestSettings,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "BenchConfig::default_log_level")]
    pub log_level: String,
}

/// Which device to open and how
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "DeviceSettings::default_vid")]
    pub vid: u16,
    #[serde(default = "DeviceSettings::default_pid")]
    pub pid: u16,
    #[serde(default)]
    pub interface: u8,
    #[serde(default)]
    pub alt_setting: u8,
    /// Endpoint number (low nibble); 0 picks the first endpoint of each direction
    #[serde(default)]
    pub endpoint: u8,
    /// Skip the SET_TEST vendor request
    #[serde(default)]
    pub no_test_select: bool,
}

/// How the test runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSettings {
    #[serde(default)]
    pub test_type: TestType,
    #[serde(default)]
    pub mode: TransferMode,
    /// Status line interval in milliseconds
    #[serde(default = "TestSettings::default_refresh_ms")]
    pub refresh_ms: u64,
    /// Per-transfer timeout in milliseconds
    #[serde(default = "TestSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive timeouts or errors tolerated before an endpoint stops
    #[serde(default)]
    pub retry: u32,
    #[serde(default = "TestSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// Transfers kept in flight per endpoint; more than one implies async
    #[serde(default = "TestSettings::default_buffer_count")]
    pub buffer_count: usize,
    /// Isochronous packet size; 0 uses the endpoint's max packet size
    #[serde(default)]
    pub iso_packet_size: usize,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub verify_details: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Sync,
    Async,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMode::Sync => f.write_str("sync"),
            TransferMode::Async => f.write_str("async"),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings::default(),
            test: TestSettings::default(),
            log_level: Self::default_log_level(),
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vid: Self::default_vid(),
            pid: Self::default_pid(),
            interface: 0,
            alt_setting: 0,
            endpoint: 0,
            no_test_select: false,
        }
    }
}

impl DeviceSettings {
    fn default_vid() -> u16 {
        0x0666
    }

    fn default_pid() -> u16 {
        0x0001
    }
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            test_type: TestType::default(),
            mode: TransferMode::default(),
            refresh_ms: Self::default_refresh_ms(),
            timeout_ms: Self::default_timeout_ms(),
            retry: 0,
            buffer_size: Self::default_buffer_size(),
            buffer_count: Self::default_buffer_count(),
            iso_packet_size: 0,
            verify: false,
            verify_details: false,
        }
    }
}

impl TestSettings {
    fn default_refresh_ms() -> u64 {
        1000
    }

    fn default_timeout_ms() -> u64 {
        1000
    }

    fn default_buffer_size() -> usize {
        4096
    }

    fn default_buffer_count() -> usize {
        1
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Transfer mode after applying the buffer count rule
    pub fn effective_mode(&self) -> TransferMode {
        if self.buffer_count > 1 {
            TransferMode::Async
        } else {
            self.mode
        }
    }
}

impl BenchConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from file
    ///
    /// Searches in order:
    /// 1. Provided path
    /// 2. ~/.config/usb-bench/bench.toml
    /// 3. ./bench.toml
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("bench.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BenchConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-bench").join("bench.toml")
        } else {
            PathBuf::from(".config/usb-bench/bench.toml")
        }
    }

    /// Expand `~` in a user supplied path
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        let test = &self.test;
        if test.buffer_count < 1 || test.buffer_count > MAX_OUTSTANDING_TRANSFERS {
            return Err(anyhow!(
                "Invalid buffer count {}, must be greater than 0 and at most {}",
                test.buffer_count,
                MAX_OUTSTANDING_TRANSFERS
            ));
        }
        if test.buffer_size == 0 {
            return Err(anyhow!("Buffer size must be greater than 0"));
        }
        if test.refresh_ms == 0 {
            return Err(anyhow!("Refresh interval must be greater than 0"));
        }
        if test.verify_details && !test.verify {
            tracing::warn!("verify_details has no effect without verify");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BenchConfig::default();
        assert_eq!(config.device.vid, 0x0666);
        assert_eq!(config.device.pid, 0x0001);
        assert_eq!(config.test.test_type, TestType::Loop);
        assert_eq!(config.test.buffer_size, 4096);
        assert_eq!(config.test.buffer_count, 1);
        assert_eq!(config.test.timeout_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_mode() {
        let mut test = TestSettings::default();
        assert_eq!(test.effective_mode(), TransferMode::Sync);
        test.buffer_count = 2;
        assert_eq!(test.effective_mode(), TransferMode::Async);
    }

    #[test]
    fn test_validate_buffer_count() {
        let mut config = BenchConfig::default();
        config.test.buffer_count = 0;
        assert!(config.validate().is_err());
        config.test.buffer_count = 10;
        assert!(config.validate().is_ok());
        config.test.buffer_count = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = BenchConfig::default();
        config.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: BenchConfig = toml::from_str(
            r#"
[test]
test_type = "read"
buffer_count = 4
"#,
        )
        .unwrap();
        assert_eq!(config.test.test_type, TestType::Read);
        assert_eq!(config.test.buffer_count, 4);
        assert_eq!(config.test.buffer_size, 4096);
        assert_eq!(config.device.vid, 0x0666);
        assert_eq!(config.log_level, "info");
    }
}
