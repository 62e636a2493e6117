use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const THROTTLE_RANGE_MS: (u64, u64) = (10, 5_000);
pub const ENFORCEMENT_DURATION_RANGE_MS: (u64, u64) = (1_000, 30_000);
pub const ENFORCEMENT_INTERVAL_RANGE_MS: (u64, u64) = (100, 5_000);
pub const POLL_INTERVAL_RANGE_MS: (u64, u64) = (500, 60_000);
pub const REFRESH_INTERVAL_RANGE_MS: (u64, u64) = (5_000, 600_000);
pub const REFRESH_TIMEOUT_RANGE_MS: (u64, u64) = (1_000, 120_000);
pub const WRITE_LOCK_TIMEOUT_RANGE_MS: (u64, u64) = (100, 30_000);

fn clamp(value: u64, (min, max): (u64, u64)) -> u64 {
    value.clamp(min, max)
}

/// Persisted service configuration. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub ddc_write_throttle_ms: u64,
    pub enforcement_duration_ms: u64,
    pub enforcement_interval_ms: u64,
    pub brightness_poll_interval_ms: u64,
    pub monitor_refresh_interval_ms: u64,
    pub refresh_timeout_ms: u64,
    pub write_lock_timeout_ms: u64,
    pub log_retention_count: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ddc_write_throttle_ms: 100,
            enforcement_duration_ms: 5_000,
            enforcement_interval_ms: 500,
            brightness_poll_interval_ms: 5_000,
            monitor_refresh_interval_ms: 60_000,
            refresh_timeout_ms: 15_000,
            write_lock_timeout_ms: 2_000,
            log_retention_count: 10,
        }
    }
}

impl SyncConfig {
    /// Returns a copy with every value clamped into its supported range.
    pub fn sanitized(&self) -> Self {
        Self {
            ddc_write_throttle_ms: clamp(self.ddc_write_throttle_ms, THROTTLE_RANGE_MS),
            enforcement_duration_ms: clamp(self.enforcement_duration_ms, ENFORCEMENT_DURATION_RANGE_MS),
            enforcement_interval_ms: clamp(self.enforcement_interval_ms, ENFORCEMENT_INTERVAL_RANGE_MS),
            brightness_poll_interval_ms: clamp(self.brightness_poll_interval_ms, POLL_INTERVAL_RANGE_MS),
            monitor_refresh_interval_ms: clamp(self.monitor_refresh_interval_ms, REFRESH_INTERVAL_RANGE_MS),
            refresh_timeout_ms: clamp(self.refresh_timeout_ms, REFRESH_TIMEOUT_RANGE_MS),
            write_lock_timeout_ms: clamp(self.write_lock_timeout_ms, WRITE_LOCK_TIMEOUT_RANGE_MS),
            log_retention_count: self.log_retention_count.clamp(1, 100),
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            throttle_ms: self.ddc_write_throttle_ms,
            enforcement_duration_ms: self.enforcement_duration_ms,
            enforcement_interval_ms: self.enforcement_interval_ms,
        }
        .clamped()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.brightness_poll_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_refresh_interval_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }
}

/// Write throttling and enforcement timing of a reconciliation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub throttle_ms: u64,
    pub enforcement_duration_ms: u64,
    pub enforcement_interval_ms: u64,
}

impl StoreSettings {
    pub fn clamped(self) -> Self {
        Self {
            throttle_ms: clamp(self.throttle_ms, THROTTLE_RANGE_MS),
            enforcement_duration_ms: clamp(self.enforcement_duration_ms, ENFORCEMENT_DURATION_RANGE_MS),
            enforcement_interval_ms: clamp(self.enforcement_interval_ms, ENFORCEMENT_INTERVAL_RANGE_MS),
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn enforcement_duration(&self) -> Duration {
        Duration::from_millis(self.enforcement_duration_ms)
    }

    pub fn enforcement_interval(&self) -> Duration {
        Duration::from_millis(self.enforcement_interval_ms)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        SyncConfig::default().store_settings()
    }
}

/// Location of the config file, logs and state database.
pub struct Config {
    config_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    /// Uses `LUMENSYNC_DATA_DIR` when set, otherwise `%APPDATA%\LumenSync`
    /// on Windows and the XDG config directory elsewhere.
    pub fn new() -> Result<Self> {
        Self::at(default_data_dir()?)
    }

    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        Ok(Self {
            config_path: data_dir.join("config.json"),
            data_dir,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn load(&self) -> Result<SyncConfig> {
        if !self.config_path.exists() {
            return Ok(SyncConfig::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .context("Failed to read config file")?;

        let config: SyncConfig = serde_json::from_str(&content)
            .context("Failed to parse config file")?;

        Ok(config.sanitized())
    }

    pub fn save(&self, config: &SyncConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)
            .context("Failed to serialize config")?;

        fs::write(&self.config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }
}

fn default_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("LUMENSYNC_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }

    if cfg!(windows) {
        let app_data = std::env::var("APPDATA")
            .context("Failed to get APPDATA environment variable")?;
        return Ok(PathBuf::from(app_data).join("LumenSync"));
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("lumensync"));
    }
    let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
    Ok(PathBuf::from(home).join(".config").join("lumensync"))
}
