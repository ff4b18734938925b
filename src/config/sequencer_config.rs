//! Strongly-typed sequencer configuration loaded with Figment.
//!
//! Every section has defaults, so an empty or missing file yields a working
//! configuration. Durations are humantime strings (`"250ms"`, `"10m"`).
//! Template minimum versions must be quoted strings (`science = "0.5"`); in
//! environment variables that means `OBSEQ_TEMPLATES__SCIENCE='"0.5"'`.

use crate::action::ActionTimeouts;
use crate::bus::DEFAULT_POLL_INTERVAL;
use crate::logging::LogFormat;
use crate::ob::{default_minimum_versions, MinimumVersions};
use crate::orchestrator::OrchestratorSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/sequencer.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "OBSEQ_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device bus settings
    pub bus: BusConfig,
    /// Confirmation timeout per action kind
    pub timeouts: ActionTimeouts,
    /// Minimum compatible version per template
    pub templates: MinimumVersions,
    /// Execution behaviour
    pub execution: ExecutionConfig,
    /// Alert delivery
    pub alerts: AlertConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            bus: BusConfig::default(),
            timeouts: ActionTimeouts::default(),
            templates: default_minimum_versions(),
            execution: ExecutionConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Script name recorded as the lock holder
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "obseq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// Device bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Interval between readback polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Step execution switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempt one abort/reset/restart cycle when a detector faults
    pub detector_recovery: bool,
    /// Power the block's lamps while configuring, ahead of their steps
    pub prepower_lamps: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            detector_recovery: true,
            prepower_lamps: true,
        }
    }
}

/// Failure alert settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Send alerts for destination timeouts and step failures
    pub enabled: bool,
    /// Prefix of every alert subject line
    pub subject_prefix: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subject_prefix: "[obseq]".to_string(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SequencerConfig {
    /// Load configuration from `config/sequencer.toml` and environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if:
    /// - The config file is malformed
    /// - Configuration validation fails
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file is not an
    /// error; defaults and environment variables still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SequencerConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Poll interval and every timeout are non-zero
    /// - Every template has a minimum version
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "application.name must not be empty".to_string(),
            ));
        }

        if self.bus.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "bus.poll_interval must be greater than zero".to_string(),
            ));
        }

        if let Some((kind, _)) = self.timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ValidationError(format!(
                "timeouts.{} must be greater than zero",
                kind.as_str()
            )));
        }

        for template in crate::ob::TemplateName::ALL {
            if !self.templates.contains_key(&template) {
                return Err(ConfigError::ValidationError(format!(
                    "templates.{} has no minimum version",
                    template.as_str()
                )));
            }
        }

        Ok(())
    }

    /// Orchestrator switches derived from this configuration.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            minimum_versions: self.templates.clone(),
            detector_recovery: self.execution.detector_recovery,
            prepower_lamps: self.execution.prepower_lamps,
            alerts_enabled: self.alerts.enabled,
            alert_subject_prefix: self.alerts.subject_prefix.clone(),
        }
    }
}
