//! Configuration file structures for wasmbind.
//!
//! This module defines structures for configuration files (TOML, or JSON
//! for files ending in `.json`):
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ModuleEntry`]: Module to register at startup
//! - [`TimerEntry`]: Root instance driven by a periodic timer

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{RuntimeConfig, RuntimeError};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime]
/// name = "main"
///
/// [runtime.engine]
/// pooling_allocator = true
/// max_instances = 1000
///
/// [runtime.execution]
/// max_fuel = 10_000_000
/// timeout_ms = 100
///
/// [[modules]]
/// name = "filter"
/// path = "./modules/filter.wasm"
///
/// [[timers]]
/// entity = "filter-root"
/// module = "filter"
/// host = "pairs"
/// callback = "on_timer"
/// period_ms = 500
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (VM name, engine and execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Modules to register at startup.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,

    /// Timer-driven root instances.
    #[serde(default)]
    pub timers: Vec<TimerEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as JSON.
    pub fn from_json(content: &str) -> Result<Self, ConfigFileError> {
        serde_json::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Check names, paths and periods before anything is registered.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.runtime.name.is_empty() {
            return Err(RuntimeError::invalid_config("invalid vm name \"\""));
        }

        let mut names = HashSet::new();
        for module in &self.modules {
            if module.name.is_empty() {
                return Err(RuntimeError::invalid_config("invalid module name \"\""));
            }
            if module.path.as_os_str().is_empty() {
                return Err(RuntimeError::invalid_config(format!(
                    "invalid module path \"\" for module \"{}\"",
                    module.name
                )));
            }
            if !names.insert(module.name.as_str()) {
                return Err(RuntimeError::ModuleAlreadyExists {
                    name: module.name.clone(),
                });
            }
        }

        let mut entities = HashSet::new();
        for timer in &self.timers {
            if !entities.insert(timer.entity.as_str()) {
                return Err(RuntimeError::invalid_config(format!(
                    "timer entity \"{}\" already defined",
                    timer.entity
                )));
            }
            if !names.contains(timer.module.as_str()) {
                return Err(RuntimeError::invalid_config(format!(
                    "timer \"{}\" refers to unknown module \"{}\"",
                    timer.entity, timer.module
                )));
            }
            if timer.period_ms == Some(0) {
                return Err(RuntimeError::invalid_config(format!(
                    "timer \"{}\" has a zero period",
                    timer.entity
                )));
            }
        }

        Ok(())
    }
}

/// A module entry to register at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleEntry {
    /// Unique module name within the VM.
    pub name: String,

    /// Path to the module (`.wasm` binary or `.wat` text).
    pub path: PathBuf,
}

/// A root instance driven by a periodic timer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimerEntry {
    /// Unique entity name, used to cancel the timer.
    pub entity: String,

    /// Module to instantiate as the root instance.
    pub module: String,

    /// Host interface to link the module against.
    #[serde(default = "defaults::timer_host")]
    pub host: String,

    /// Export invoked on every tick.
    #[serde(default = "defaults::timer_callback")]
    pub callback: String,

    /// Tick period; falls back to `runtime.execution.timer_period_ms`.
    #[serde(default)]
    pub period_ms: Option<u64>,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn timer_host() -> String {
        "core".to_string()
    }

    pub fn timer_callback() -> String {
        "on_timer".to_string()
    }
}
