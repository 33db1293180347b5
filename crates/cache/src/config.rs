//! Cache configuration for memory budgets and the cleanup timer.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically. Sizes are given in megabytes at the edges
//! and stored in bytes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::budget::Dimension;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Default period of the cleanup timer
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

pub const ENV_VM_CEILING_MB: &str = "BUTTERPAPER_CACHE_VM_CEILING_MB";
pub const ENV_VM_LOW_WATER_MB: &str = "BUTTERPAPER_CACHE_VM_LOW_WATER_MB";
pub const ENV_GPU_CEILING_MB: &str = "BUTTERPAPER_CACHE_GPU_CEILING_MB";
pub const ENV_GPU_LOW_WATER_MB: &str = "BUTTERPAPER_CACHE_GPU_LOW_WATER_MB";
pub const ENV_CLEANUP_INTERVAL_MS: &str = "BUTTERPAPER_CACHE_CLEANUP_INTERVAL_MS";

/// Ceiling and low-water mark of one budget dimension, in bytes.
///
/// `None` for the ceiling means unbounded. `None` for the low-water mark
/// means 80% of the ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetLimits {
    pub ceiling: Option<u64>,
    pub low_water: Option<u64>,
}

impl BudgetLimits {
    /// Returns true if the ceiling is below an explicit low-water mark
    pub fn is_inverted(&self) -> bool {
        matches!((self.ceiling, self.low_water), (Some(c), Some(l)) if c < l)
    }
}

/// Configuration for the object cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Process memory budget
    pub vm: BudgetLimits,
    /// Graphics memory budget
    pub gpu: BudgetLimits,
    /// Period of the cleanup timer, `None` to run cleanup manually
    pub cleanup_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            vm: BudgetLimits::default(),
            gpu: BudgetLimits::default(),
            cleanup_interval: Some(DEFAULT_CLEANUP_INTERVAL),
        }
    }
}

/// On-disk representation
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    vm_ceiling_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vm_low_water_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_ceiling_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpu_low_water_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cleanup_interval_ms: Option<u64>,
}

impl CacheConfig {
    /// Creates a configuration with both ceilings in megabytes and the
    /// default low-water marks and cleanup interval.
    pub fn new(vm_ceiling_mb: u64, gpu_ceiling_mb: u64) -> Self {
        Self::default()
            .with_vm_ceiling_mb(vm_ceiling_mb)
            .with_gpu_ceiling_mb(gpu_ceiling_mb)
    }

    /// Sets the VM ceiling in megabytes.
    pub fn with_vm_ceiling_mb(mut self, mb: u64) -> Self {
        self.vm.ceiling = Some(mb.saturating_mul(BYTES_PER_MB));
        self
    }

    /// Sets the VM low-water mark in megabytes.
    pub fn with_vm_low_water_mb(mut self, mb: u64) -> Self {
        self.vm.low_water = Some(mb.saturating_mul(BYTES_PER_MB));
        self
    }

    /// Sets the GPU ceiling in megabytes.
    pub fn with_gpu_ceiling_mb(mut self, mb: u64) -> Self {
        self.gpu.ceiling = Some(mb.saturating_mul(BYTES_PER_MB));
        self
    }

    /// Sets the GPU low-water mark in megabytes.
    pub fn with_gpu_low_water_mb(mut self, mb: u64) -> Self {
        self.gpu.low_water = Some(mb.saturating_mul(BYTES_PER_MB));
        self
    }

    /// Sets the cleanup timer period, `None` disables the timer.
    pub fn with_cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Limits of one dimension
    pub fn limits(&self, dimension: Dimension) -> &BudgetLimits {
        match dimension {
            Dimension::Vm => &self.vm,
            Dimension::Gpu => &self.gpu,
        }
    }

    /// Returns the default configuration file path for the current platform.
    ///
    /// - macOS: ~/Library/Application Support/butterpaper/object-cache.toml
    /// - Linux: ~/.config/butterpaper/object-cache.toml
    /// - Windows: %APPDATA%\butterpaper\object-cache.toml
    pub fn default_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("butterpaper").join("object-cache.toml")
        } else {
            PathBuf::from("object-cache.toml")
        }
    }

    /// Loads the configuration file at [`CacheConfig::default_config_path`]
    /// if it exists, then applies environment overrides.
    ///
    /// # Errors
    /// Returns an error if the file or an environment variable is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_config_path();
        let config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.with_env_overrides()
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `BUTTERPAPER_CACHE_VM_CEILING_MB`: VM ceiling in MB (default: unbounded)
    /// - `BUTTERPAPER_CACHE_VM_LOW_WATER_MB`: VM low-water mark in MB
    /// - `BUTTERPAPER_CACHE_GPU_CEILING_MB`: GPU ceiling in MB (default: unbounded)
    /// - `BUTTERPAPER_CACHE_GPU_LOW_WATER_MB`: GPU low-water mark in MB
    /// - `BUTTERPAPER_CACHE_CLEANUP_INTERVAL_MS`: cleanup period, 0 disables
    ///   the timer (default: 1000)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Overrides settings with the environment variables that are set
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(bytes) = env_megabytes(ENV_VM_CEILING_MB)? {
            self.vm.ceiling = Some(bytes);
        }
        if let Some(bytes) = env_megabytes(ENV_VM_LOW_WATER_MB)? {
            self.vm.low_water = Some(bytes);
        }
        if let Some(bytes) = env_megabytes(ENV_GPU_CEILING_MB)? {
            self.gpu.ceiling = Some(bytes);
        }
        if let Some(bytes) = env_megabytes(ENV_GPU_LOW_WATER_MB)? {
            self.gpu.low_water = Some(bytes);
        }
        if let Ok(val) = std::env::var(ENV_CLEANUP_INTERVAL_MS) {
            let ms = parse_number(ENV_CLEANUP_INTERVAL_MS, &val)?;
            self.cleanup_interval = interval_from_ms(ms);
        }

        self.warn_if_inverted();
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// vm_ceiling_mb = 512
    /// vm_low_water_mb = 384
    /// gpu_ceiling_mb = 1024
    /// cleanup_interval_ms = 1000
    /// ```
    ///
    /// Missing keys keep their defaults and unknown keys are ignored.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;

        let mut config = Self::default();
        config.vm.ceiling = megabytes("vm_ceiling_mb", file.vm_ceiling_mb)?;
        config.vm.low_water = megabytes("vm_low_water_mb", file.vm_low_water_mb)?;
        config.gpu.ceiling = megabytes("gpu_ceiling_mb", file.gpu_ceiling_mb)?;
        config.gpu.low_water = megabytes("gpu_low_water_mb", file.gpu_low_water_mb)?;
        if let Some(ms) = file.cleanup_interval_ms {
            config.cleanup_interval = interval_from_ms(ms);
        }

        config.warn_if_inverted();
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// Sizes are written in whole megabytes.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            vm_ceiling_mb: self.vm.ceiling.map(|b| b / BYTES_PER_MB),
            vm_low_water_mb: self.vm.low_water.map(|b| b / BYTES_PER_MB),
            gpu_ceiling_mb: self.gpu.ceiling.map(|b| b / BYTES_PER_MB),
            gpu_low_water_mb: self.gpu.low_water.map(|b| b / BYTES_PER_MB),
            cleanup_interval_ms: Some(
                self.cleanup_interval
                    .map_or(0, |interval| interval.as_millis() as u64),
            ),
        };
        Ok(toml::to_string(&file)?)
    }

    fn warn_if_inverted(&self) {
        for dimension in Dimension::ALL {
            let limits = self.limits(dimension);
            if limits.is_inverted() {
                warn!(
                    dimension = %dimension,
                    ceiling = ?limits.ceiling,
                    low_water = ?limits.low_water,
                    "configured cache ceiling is below its low-water mark"
                );
            }
        }
    }
}

fn interval_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

fn megabytes(key: &str, mb: Option<u64>) -> Result<Option<u64>, ConfigError> {
    mb.map(|mb| {
        mb.checked_mul(BYTES_PER_MB)
            .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))
    })
    .transpose()
}

fn env_megabytes(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => megabytes(key, Some(parse_number(key, &val)?)),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
