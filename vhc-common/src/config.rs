//! Configuration loading for the VHC engine
//!
//! Resolution priority:
//! 1. Explicit path handed in by the host application (highest)
//! 2. `VHC_CONFIG` environment variable
//! 3. Platform config directory (`<config-dir>/vhc/config.toml`)
//! 4. Compiled defaults (fallback)
//!
//! A missing file at the platform location is not an error; the engine
//! starts on compiled defaults. An explicit or env-supplied path that
//! cannot be read is an error, since the operator asked for it.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Hourly labour rate shown to technicians
    pub labour_rate_technician: Decimal,
    /// Hourly labour rate billed to customers
    pub labour_rate_customer: Decimal,
    /// Buffer window for debounced field writes, milliseconds
    pub debounce_ms: u64,
    /// Event bus channel capacity
    pub event_capacity: usize,
    /// SQLite database path for the reference store adapter
    pub database_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            labour_rate_technician: Decimal::new(9000, 2),
            labour_rate_customer: Decimal::new(15000, 2),
            debounce_ms: 650,
            event_capacity: 1000,
            database_path: None,
        }
    }
}

/// TOML file schema; every field optional, omissions fall back to defaults
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    labour_rate_technician: Option<Decimal>,
    labour_rate_customer: Option<Decimal>,
    debounce_ms: Option<u64>,
    event_capacity: Option<usize>,
    database_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration following the resolution priority order.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(env_path) = std::env::var("VHC_CONFIG") {
            return Self::from_file(Path::new(&env_path));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("vhc").join("config.toml");
            if path.exists() {
                return Self::from_file(&path);
            }
            tracing::debug!(path = %path.display(), "No config file found, using defaults");
        }

        Ok(Self::default())
    }

    /// Load and validate a specific config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let file: ConfigFile = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;

        let defaults = Self::default();
        let config = Self {
            labour_rate_technician: file
                .labour_rate_technician
                .unwrap_or(defaults.labour_rate_technician),
            labour_rate_customer: file
                .labour_rate_customer
                .unwrap_or(defaults.labour_rate_customer),
            debounce_ms: file.debounce_ms.unwrap_or(defaults.debounce_ms),
            event_capacity: file.event_capacity.unwrap_or(defaults.event_capacity),
            database_path: file.database_path.or(defaults.database_path),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run on.
    pub fn validate(&self) -> Result<()> {
        if self.labour_rate_technician < Decimal::ZERO {
            return Err(Error::Config("labour_rate_technician is negative".into()));
        }
        if self.labour_rate_customer < Decimal::ZERO {
            return Err(Error::Config("labour_rate_customer is negative".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Debounce window as a Duration.
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
