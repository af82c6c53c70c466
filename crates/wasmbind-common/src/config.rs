//! Configuration structures for wasmbind.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration for one named VM
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs)
//! - [`ExecutionConfig`]: Per-call execution limits (fuel, memory, timeout)

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// One `RuntimeConfig` describes one named VM. It can be loaded from files
/// (TOML, JSON) or built in code.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Name of the VM, attached to every log line the runtime emits.
    #[serde(default = "defaults::vm_name")]
    pub name: String,

    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: defaults::vm_name(),
            engine: EngineConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Wasmtime engine configuration.
///
/// These settings affect the process-wide Wasmtime engine behavior,
/// including the memory allocation strategy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// When enabled, memory is pre-allocated for a pool of instances,
    /// reducing instantiation time from ~1ms to ~10µs.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// This determines the maximum linear memory each instance can use.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// This allows interrupting long-running WebAssembly execution
    /// based on time rather than fuel consumption.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

/// Per-call execution configuration.
///
/// These settings control resource limits for guest code running inside
/// an execution context.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per export call.
    ///
    /// Fuel metering provides deterministic CPU limiting.
    /// A typical simple function consumes ~1,000-10,000 fuel.
    /// Complex operations may consume millions.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Execution timeout in milliseconds (epoch ticks).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory in megabytes per context.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Enable fuel metering.
    ///
    /// When enabled, CPU usage is tracked and limited by the `max_fuel` setting.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Default period of timer resumption loops, in milliseconds.
    #[serde(default = "defaults::timer_period_ms")]
    pub timer_period_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
            fuel_metering: defaults::fuel_metering(),
            timer_period_ms: defaults::timer_period_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the default timer period as a `Duration`.
    pub fn timer_period(&self) -> Duration {
        Duration::from_millis(self.timer_period_ms)
    }

    /// Maximum linear memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Default value functions for serde.
mod defaults {
    pub fn vm_name() -> String {
        "main".to_string()
    }

    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn timeout_ms() -> u64 {
        100
    }

    pub const fn max_memory_mb() -> u32 {
        128
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn timer_period_ms() -> u64 {
        1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert_eq!(config.name, "main");
        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert_eq!(config.engine.instance_memory_mb, 64);
        assert!(config.engine.epoch_interruption);

        assert_eq!(config.execution.max_fuel, 10_000_000);
        assert_eq!(config.execution.timeout_ms, 100);
        assert_eq!(config.execution.max_memory_mb, 128);
        assert!(config.execution.fuel_metering);
        assert_eq!(config.execution.timer_period_ms, 1000);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.name, deserialized.name);
        assert_eq!(
            config.engine.max_instances,
            deserialized.engine.max_instances
        );
        assert_eq!(config.execution.max_fuel, deserialized.execution.max_fuel);
    }

    #[test]
    fn test_execution_durations() {
        let config = ExecutionConfig {
            timeout_ms: 500,
            timer_period_ms: 250,
            max_memory_mb: 2,
            ..Default::default()
        };

        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.timer_period(), Duration::from_millis(250));
        assert_eq!(config.max_memory_bytes(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"name": "edge", "engine": {"max_instances": 500}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.name, "edge");
        assert_eq!(config.engine.max_instances, 500);
        // Default values for unspecified fields
        assert!(config.engine.pooling_allocator);
        assert_eq!(config.execution.max_fuel, 10_000_000);
    }
}
