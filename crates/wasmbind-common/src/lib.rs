//! Common types, errors, and configuration for wasmbind.
//!
//! This crate provides shared functionality used across the wasmbind workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime settings
//! - The TOML configuration file model

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, ExecutionConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ModuleEntry, TimerEntry};
pub use error::{CodecError, HostFunctionError, RuntimeError};
