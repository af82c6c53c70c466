//! Per-context store data and store management.
//!
//! This module provides:
//! - [`ContextData`]: State of one execution context, reachable from host functions
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Counters accumulated over the context's calls
//!
//! Fuel and the epoch deadline are armed per export call by
//! [`begin_call`]; [`end_call`] records what the call consumed.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use uuid::Uuid;
use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};

use crate::WasmEngine;
use crate::pairs::PairsMap;
use wasmbind_common::{ExecutionConfig, RuntimeError};

/// State owned by one execution context.
///
/// Host functions reach it through [`crate::HostCall::data`] and
/// [`crate::HostCall::data_mut`].
pub struct ContextData {
    /// Unique scope identifier for tracing.
    pub scope_id: Uuid,

    /// Logs collected from guest code.
    pub logs: Vec<LogEntry>,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,

    /// Key/value maps exchanged with guests, keyed by map id.
    maps: BTreeMap<u32, PairsMap>,

    limits: StoreLimits,

    start_time: Instant,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Module whose instance logged the message.
    pub module: String,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Counters accumulated over the calls of one context.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Export calls made.
    pub calls: u64,

    /// Export calls that trapped.
    pub traps: u64,

    /// Fuel consumed by the last call.
    pub last_fuel_consumed: u64,

    /// Fuel consumed over all calls.
    pub fuel_consumed: u64,

    /// Instances created.
    pub instances: u64,

    /// Lifetime of the context, set when it is destroyed.
    pub duration: Option<Duration>,
}

impl ContextData {
    /// Create store data for a new scope.
    pub fn new(scope_id: Uuid, config: &ExecutionConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .build();

        Self {
            scope_id,
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
            maps: BTreeMap::new(),
            limits,
            start_time: Instant::now(),
        }
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, module: &str, message: String) {
        self.logs.push(LogEntry {
            level,
            module: module.to_string(),
            message,
            timestamp: Instant::now(),
        });
    }

    /// The map stored under `id`, if any.
    pub fn map(&self, id: u32) -> Option<&PairsMap> {
        self.maps.get(&id)
    }

    /// The map stored under `id`, created empty on first use.
    pub fn map_mut(&mut self, id: u32) -> &mut PairsMap {
        self.maps.entry(id).or_default()
    }

    /// Replace the map stored under `id`.
    pub fn set_map(&mut self, id: u32, map: PairsMap) {
        self.maps.insert(id, map);
    }

    /// Get elapsed time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finalize metrics before the context goes away.
    pub fn finalize_metrics(&mut self) {
        self.metrics.duration = Some(self.elapsed());
    }
}

impl std::fmt::Debug for ContextData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextData")
            .field("scope_id", &self.scope_id)
            .field("logs", &self.logs.len())
            .field("metrics", &self.metrics)
            .field("maps", &self.maps.len())
            .finish_non_exhaustive()
    }
}

/// Create the store backing one execution context.
///
/// Stores without fuel metering get unlimited fuel, since the engine
/// always consumes it.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    scope_id: Uuid,
) -> Result<Store<ContextData>, RuntimeError> {
    let mut store = Store::new(engine.inner(), ContextData::new(scope_id, config));
    store.limiter(|data| &mut data.limits);

    arm(&mut store, engine, config)?;

    Ok(store)
}

fn arm(
    store: &mut Store<ContextData>,
    engine: &WasmEngine,
    config: &ExecutionConfig,
) -> Result<u64, RuntimeError> {
    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };

    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    // Deadline is relative to the current epoch; one tick per millisecond
    if engine.config().epoch_interruption {
        store.set_epoch_deadline(config.timeout_ms);
    }

    Ok(fuel)
}

/// Re-arm fuel and the epoch deadline before an export call.
///
/// Returns the fuel the call starts with.
pub(crate) fn begin_call(
    store: &mut Store<ContextData>,
    engine: &WasmEngine,
    config: &ExecutionConfig,
) -> Result<u64, RuntimeError> {
    arm(store, engine, config)
}

/// Record the fuel consumed by a call that started with `initial_fuel`.
pub(crate) fn end_call(store: &mut Store<ContextData>, initial_fuel: u64, trapped: bool) -> u64 {
    let consumed = calculate_fuel_consumed(initial_fuel, store);

    let metrics = &mut store.data_mut().metrics;
    metrics.calls += 1;
    metrics.last_fuel_consumed = consumed;
    metrics.fuel_consumed = metrics.fuel_consumed.saturating_add(consumed);
    if trapped {
        metrics.traps += 1;
    }

    consumed
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<ContextData>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<ContextData>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
