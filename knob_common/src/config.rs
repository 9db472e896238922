//! Engine configuration and TOML loading.
//!
//! All tuning constants of the knob engine live here so they can be
//! threaded through constructors instead of being read from process
//! globals. The defaults reproduce the behavior of the original operator
//! tool; none of them are assumed to generalize to other actuator classes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use knob_common::config::{ConfigLoader, EngineConfig};
//! use std::path::Path;
//!
//! let config = EngineConfig::load(Path::new("engine.toml")).unwrap();
//! config.validate().unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Tuning parameters for the knob engine.
///
/// Durations are stored as seconds in TOML for human-diffable files.
///
/// # TOML Example
///
/// ```toml
/// settle_wait_secs = 1.0
/// tracking_window_secs = 2.0
/// tracking_tolerance = 0.001
/// lower_limit_suffix = ".LOPR"
/// upper_limit_suffix = ".HOPR"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum time a coordinated move waits for a prior pending write to
    /// settle before proceeding anyway.
    pub settle_wait_secs: f64,

    /// Window after a write during which an element is considered tracking
    /// regardless of the monitored value.
    pub tracking_window_secs: f64,

    /// Fraction of the limit span within which setting and monitored values
    /// are considered tracking.
    pub tracking_tolerance: f64,

    /// Factor applied to raw limits to obtain effective limits when the
    /// value wraps around them.
    pub effective_limit_factor: f64,

    /// Factor used to synthesize a fallback knob range when limits cannot
    /// be computed.
    pub fallback_span_factor: f64,

    /// Relative tolerance below which a recomputed knob range does not
    /// notify listeners.
    pub limit_change_tolerance: f64,

    /// Optional symmetric default limit seeding element bounds and custom
    /// limits on attach.
    pub default_limit: Option<f64>,

    /// Suffix appended to a PV name to form its remote lower-limit PV.
    pub lower_limit_suffix: String,

    /// Suffix appended to a PV name to form its remote upper-limit PV.
    pub upper_limit_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_wait_secs: 1.0,
            tracking_window_secs: 2.0,
            tracking_tolerance: 1.0e-3,
            effective_limit_factor: 100.0,
            fallback_span_factor: 1000.0,
            limit_change_tolerance: 1.0e-6,
            default_limit: None,
            lower_limit_suffix: ".LOPR".to_string(),
            upper_limit_suffix: ".HOPR".to_string(),
        }
    }
}

impl EngineConfig {
    /// Maximum pending-write wait as a [`Duration`].
    pub fn settle_wait(&self) -> Duration {
        Duration::from_secs_f64(self.settle_wait_secs)
    }

    /// Tracking staleness window as a [`Duration`].
    pub fn tracking_window(&self) -> Duration {
        Duration::from_secs_f64(self.tracking_window_secs)
    }

    /// Remote lower-limit PV name for a base PV.
    pub fn lower_limit_pv(&self, pv: &str) -> String {
        format!("{pv}{}", self.lower_limit_suffix)
    }

    /// Remote upper-limit PV name for a base PV.
    pub fn upper_limit_pv(&self, pv: &str) -> String {
        format!("{pv}{}", self.upper_limit_suffix)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - any duration or factor is not finite and positive
    /// - `default_limit` is present but not finite and positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positives = [
            ("settle_wait_secs", self.settle_wait_secs),
            ("tracking_window_secs", self.tracking_window_secs),
            ("tracking_tolerance", self.tracking_tolerance),
            ("effective_limit_factor", self.effective_limit_factor),
            ("fallback_span_factor", self.fallback_span_factor),
            ("limit_change_tolerance", self.limit_change_tolerance),
        ];
        for (name, value) in positives {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be finite and positive, got {value}"
                )));
            }
        }
        if let Some(limit) = self.default_limit {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "default_limit must be finite and positive, got {limit}"
                )));
            }
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
