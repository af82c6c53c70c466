//! Core module hosting for wasmbind.
//!
//! This crate binds WebAssembly modules to host functions and runs them
//! per scope:
//! - [`Runtime`]: One named VM owning the engine, modules and host interfaces
//! - [`Module`] and [`ModuleRegistry`]: Compiled, introspected modules by name
//! - [`LinkedModule`]: A module bound to a [`HostInterface`]
//! - [`ExecutionContext`] and [`Instance`]: Per-scope instances, reused per link
//! - [`pairs`]: The binary codec for key/value collections
//! - [`TimerScheduler`]: Periodic re-entry into long-lived root instances
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Runtime                           │
//! │  (One per VM, read-only once initialized)               │
//! │  - WasmEngine                                           │
//! │  - ModuleRegistry ──▶ Module                            │
//! │  - Host interfaces (+ core)                             │
//! └─────────────────────────────────────────────────────────┘
//!                            │ link()
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    LinkedModule                         │
//! │  (Immutable, dense index)                               │
//! │  - One host function per import                         │
//! └─────────────────────────────────────────────────────────┘
//!                            │ get_or_create_instance()
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        ExecutionContext = Store<ContextData>            │
//! │  (Per scope, isolated)                                  │
//! │  - slot[index] ──▶ Instance + trampolines               │
//! │  - Fuel metering, logs, key/value maps                  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod engine;
pub mod host;
pub mod instance;
pub mod linker;
pub mod module;
pub mod pairs;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod timer;
mod trampoline;

pub use context::ExecutionContext;
pub use engine::WasmEngine;
pub use host::{HostCall, HostFunction, HostInterface};
pub use instance::{Instance, InstanceMut};
pub use linker::LinkedModule;
pub use module::{ExportedFunc, Module, ModuleSource};
pub use pairs::{Pair, PairsMap};
pub use registry::ModuleRegistry;
pub use runtime::{Runtime, RuntimeState};
pub use store::{ContextData, ExecutionMetrics, LogEntry, LogLevel};
pub use timer::{ShutdownFlag, TimerEntity, TimerScheduler, TimerState, TimerStop};
