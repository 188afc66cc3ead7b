//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/flyscan.toml` (base configuration)
//! 2. Environment variables prefixed with `FLYSCAN_`, nested keys separated
//!    by `__` (e.g. `FLYSCAN_ACQUISITION__WATCHDOG=10m`)
//!
//! # Example
//! ```no_run
//! use flyscan::config::FlyscanConfig;
//!
//! let config = FlyscanConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::sampling::SamplingParams;
use crate::transfer::{DEFAULT_REMOTE_BIN, DEFAULT_REMOTE_TXT};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/flyscan.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlyscanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Local storage and run supervision
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Remote file retrieval
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Sample-count derivation
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Acquisition devices; the first one is the primary
    #[serde(default)]
    pub detectors: Vec<DetectorDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Local storage and run supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Root under which `data/apb/YYYY/MM/DD/` run files are written
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,
    /// Watchdog applied to kickoff and complete statuses
    #[serde(default = "default_watchdog", with = "humantime_serde")]
    pub watchdog: Duration,
}

/// Remote file retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Login user on the device host
    #[serde(default = "default_user")]
    pub user: String,
    /// Copy program
    #[serde(default = "default_program")]
    pub program: String,
    /// SSH connect timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Samples file on the device host
    #[serde(default = "default_remote_bin")]
    pub remote_bin_path: String,
    /// Settings file on the device host
    #[serde(default = "default_remote_txt")]
    pub remote_txt_path: String,
}

/// Acquisition device definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorDefinition {
    /// Device name, used as the record field
    pub name: String,
    /// Channel name prefix
    pub prefix: String,
    /// Host storing the streamed files
    pub host: String,
}

// Default value functions
fn default_name() -> String {
    "flyscan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_root_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("flyscan")
}

fn default_watchdog() -> Duration {
    Duration::from_secs(300)
}

fn default_user() -> String {
    "root".to_string()
}

fn default_program() -> String {
    "scp".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_remote_bin() -> String {
    DEFAULT_REMOTE_BIN.to_string()
}

fn default_remote_txt() -> String {
    DEFAULT_REMOTE_TXT.to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            watchdog: default_watchdog(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            program: default_program(),
            connect_timeout: default_connect_timeout(),
            remote_bin_path: default_remote_bin(),
            remote_txt_path: default_remote_txt(),
        }
    }
}

impl FlyscanConfig {
    /// Load configuration from `config/flyscan.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix FLYSCAN_
    /// Example: FLYSCAN_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLYSCAN_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.acquisition.watchdog.is_zero() {
            return Err("acquisition.watchdog must be greater than zero".to_string());
        }

        if self.sampling.lut_clock_hz <= 0.0 {
            return Err(format!(
                "Invalid sampling.lut_clock_hz {}. Must be positive",
                self.sampling.lut_clock_hz
            ));
        }
        if self.sampling.overhead_factor <= 0.0 {
            return Err(format!(
                "Invalid sampling.overhead_factor {}. Must be positive",
                self.sampling.overhead_factor
            ));
        }
        if self.sampling.rounding_quantum == 0 {
            return Err("sampling.rounding_quantum must be at least 1".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for detector in &self.detectors {
            if detector.name.is_empty() || detector.host.is_empty() {
                return Err(format!(
                    "Detector '{}' needs a name and a host",
                    detector.name
                ));
            }
            if !names.insert(&detector.name) {
                return Err(format!("Duplicate detector name: {}", detector.name));
            }
        }

        Ok(())
    }

    /// The primary detector, if any is configured
    pub fn primary_detector(&self) -> Option<&DetectorDefinition> {
        self.detectors.first()
    }
}
