//! Sequencer configuration.
//!
//! Configuration is layered with Figment, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. TOML configuration file (default: `config/sequencer.toml`, optional)
//! 3. Environment variables prefixed with `OBSEQ_`
//!
//! # Example
//!
//! ```no_run
//! use ob_sequencer::config::SequencerConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load from default location
//!     let config = SequencerConfig::load()?;
//!
//!     // Or load from custom location
//!     let config = SequencerConfig::load_from("custom/path.toml")?;
//!
//!     println!("Log level: {}", config.application.log_level);
//!     println!("Poll interval: {:?}", config.bus.poll_interval);
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! OBSEQ_APPLICATION__LOG_LEVEL=debug
//! OBSEQ_TIMEOUTS__LAMP_WARMUP=20m
//! OBSEQ_EXECUTION__DETECTOR_RECOVERY=false
//! OBSEQ_ALERTS__SUBJECT_PREFIX="[kpf]"
//! ```

pub mod sequencer_config;

pub use sequencer_config::{
    AlertConfig, ApplicationConfig, BusConfig, ConfigError, ExecutionConfig, SequencerConfig,
    DEFAULT_CONFIG_PATH, ENV_PREFIX,
};
