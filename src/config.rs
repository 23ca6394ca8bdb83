//! Engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/gpib.toml` (or an explicit path)
//! 2. Environment variables prefixed with `RUSTGPIB_`
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! RUSTGPIB_APPLICATION__LOG_LEVEL=debug
//! RUSTGPIB_BUS__LOCK_TIMEOUT_MS=8000
//! RUSTGPIB_POLLING__ENABLED=false
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_gpib::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! for instrument in config.enabled_instruments() {
//!     println!("{} at address {}", instrument.id, instrument.address);
//! }
//! # Ok::<(), rust_gpib::config::ConfigError>(())
//! ```

use crate::instrument::{BusTimeouts, InstrumentOptions};
use crate::models::ModelKind;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/gpib.toml";

/// Highest GPIB primary address.
pub const MAX_ADDRESS: u8 = 30;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub application: ApplicationConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

/// Bus timing and queueing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    /// Timeout of a single read primitive
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub command_queue_capacity: usize,
    /// How long `execute` waits for a queued command
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout(),
            io_timeout_ms: default_io_timeout(),
            command_queue_capacity: default_queue_capacity(),
            wait_timeout_ms: default_wait_timeout(),
        }
    }
}

/// Background status polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Poll on a timer; when false only service requests trigger a poll
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_poll_interval(),
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    pub model: ModelKind,
    /// GPIB primary address
    pub address: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Serial port of the bus controller (e.g. "/dev/ttyUSB0")
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baud_rate: Option<u32>,
}

impl InstrumentDefinition {
    /// Controller settings for this instrument, if it names a serial port.
    #[cfg(feature = "instrument_serial")]
    pub fn prologix_config(&self) -> Option<crate::transport::PrologixConfig> {
        self.port.as_ref().map(|port| crate::transport::PrologixConfig {
            port: port.clone(),
            baud_rate: self.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            address: self.address,
        })
    }
}

/// Baud rate used when an instrument names a port but no rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Default value functions
// ============================================================================

fn default_lock_timeout() -> u64 {
    5000
}

fn default_io_timeout() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_wait_timeout() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    500
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl EngineConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file, then apply `RUSTGPIB_` overrides and
    /// validate.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUSTGPIB_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Timeouts and queue capacity are non-zero
    /// - Poll interval is at least 10 ms
    /// - Instrument IDs are unique and non-empty
    /// - Addresses are within 0..=30
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let bus = &self.bus;
        for (name, value) in [
            ("lock_timeout_ms", bus.lock_timeout_ms),
            ("io_timeout_ms", bus.io_timeout_ms),
            ("wait_timeout_ms", bus.wait_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {name} 0. Must be > 0"
                )));
            }
        }
        if bus.command_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid command_queue_capacity 0. Must be > 0".into(),
            ));
        }

        if self.polling.interval_ms < 10 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid polling interval_ms {}. Must be >= 10",
                self.polling.interval_ms
            )));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Instrument ID cannot be empty".into(),
                ));
            }
            if !ids.insert(instrument.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            if instrument.address > MAX_ADDRESS {
                return Err(ConfigError::ValidationError(format!(
                    "Instrument '{}': address {} out of range 0..={MAX_ADDRESS}",
                    instrument.id, instrument.address
                )));
            }
            if instrument.port.as_deref().is_some_and(str::is_empty) {
                return Err(ConfigError::ValidationError(format!(
                    "Instrument '{}': 'port' cannot be empty",
                    instrument.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments.iter().filter(|inst| inst.enabled).collect()
    }

    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|inst| inst.id == id)
    }

    pub fn bus_timeouts(&self) -> BusTimeouts {
        BusTimeouts {
            lock: Duration::from_millis(self.bus.lock_timeout_ms),
            io: Duration::from_millis(self.bus.io_timeout_ms),
            wait: Duration::from_millis(self.bus.wait_timeout_ms),
        }
    }

    /// Runtime options for [`Instrument::connect`](crate::instrument::Instrument::connect).
    pub fn instrument_options(&self) -> InstrumentOptions {
        InstrumentOptions {
            timeouts: self.bus_timeouts(),
            queue_capacity: self.bus.command_queue_capacity,
            poll_interval: self
                .polling
                .enabled
                .then(|| Duration::from_millis(self.polling.interval_ms)),
        }
    }
}
