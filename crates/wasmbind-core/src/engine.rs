//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the binary engine every runtime sits on. It is:
//! - Created once per VM and shared by every execution context
//! - Optionally backed by the pooling allocator for fast instantiation
//! - Set up with fuel metering and epoch interruption for resource limiting

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use wasmbind_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// Guest calls are synchronous: a call into an export runs to completion
/// (return or trap) before control returns to the host, so async support
/// stays disabled.
///
/// # Example
///
/// ```ignore
/// use wasmbind_common::EngineConfig;
/// use wasmbind_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot be initialized.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        // Per-call CPU limit; stores without metering get unlimited fuel
        wasmtime_config.consume_fuel(true);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// One pool slot per instance, each with one memory and one table.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let slots = config.max_instances;
        let mut pooling = PoolingAllocationConfig::default();

        pooling
            .total_core_instances(slots)
            .total_memories(slots)
            .total_tables(slots)
            .max_memories_per_module(1)
            .max_memory_size((config.instance_memory_mb as usize) << 20);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    ///
    /// This should be called periodically (e.g., every 1ms) to enable
    /// epoch-based interruption for long-running executions.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Instance, Module, Store, Trap};

    const SPIN: &str = r#"(module (func (export "spin") (loop $l (br $l))))"#;

    fn engine(pooling_allocator: bool, epoch_interruption: bool) -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator,
            epoch_interruption,
            ..Default::default()
        })
        .unwrap()
    }

    fn spin(engine: &WasmEngine, store: &mut Store<()>) -> wasmtime::Error {
        let module = Module::new(engine.inner(), SPIN).unwrap();
        let instance = Instance::new(&mut *store, &module, &[]).unwrap();
        let func = instance.get_typed_func::<(), ()>(&mut *store, "spin").unwrap();
        func.call(&mut *store, ()).unwrap_err()
    }

    #[test]
    fn test_pooling_flag() {
        assert!(engine(true, false).is_pooling_enabled());
        assert!(!engine(false, false).is_pooling_enabled());
    }

    #[test]
    fn test_fuel_always_consumed() {
        let engine = engine(false, false);
        let mut store = Store::new(engine.inner(), ());

        // Fuel accounting is on whatever the execution config says
        store.set_fuel(5_000).unwrap();
        let err = spin(&engine, &mut store);

        assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::OutOfFuel));
        assert_eq!(store.get_fuel().unwrap(), 0);
    }

    #[test]
    fn test_epoch_deadline_interrupts() {
        let engine = engine(false, true);
        let mut store = Store::new(engine.inner(), ());
        store.set_fuel(u64::MAX).unwrap();
        store.set_epoch_deadline(1);

        engine.increment_epoch();
        let err = spin(&engine, &mut store);

        assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::Interrupt));
    }

    #[test]
    fn test_engine_debug() {
        let debug_str = format!("{:?}", engine(false, true));
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("epoch_interruption: true"));
    }
}
