//! Error types for wasmbind.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for the runtime, one variant family
//!   per stage (configuration, compilation, linking, instantiation, calls)
//! - [`HostFunctionError`]: Errors from host function implementations
//! - [`CodecError`]: Errors from the pairs wire codec

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// hosting WebAssembly modules, from registration to export calls.
///
/// Errors from the load phase ([`RuntimeError::is_fatal_to_startup`]) abort
/// startup. Everything else is scoped to a single context, slot or call and
/// leaves the runtime usable.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid configuration was provided (bad name, bad path, bad period).
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A module with the same name is already registered.
    #[error("Module already exists: {name}")]
    ModuleAlreadyExists {
        /// The duplicate module name.
        name: String,
    },

    /// The requested module was not found in the registry.
    #[error("Module not found: {module_id}")]
    ModuleNotFound {
        /// The identifier of the module that was not found.
        module_id: String,
    },

    /// The requested host interface was never registered.
    #[error("Host interface not found: {name}")]
    HostInterfaceNotFound {
        /// The interface name.
        name: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The module uses a feature this runtime does not host.
    #[error("Unsupported module \"{module}\": {reason}")]
    UnsupportedModule {
        /// Module name.
        module: String,
        /// What is unsupported.
        reason: String,
    },

    /// An import could not be resolved against the host interface.
    #[error("Failed importing \"{namespace}.{name}\" in module \"{module}\": missing host function")]
    MissingImport {
        /// Module name.
        module: String,
        /// Import namespace.
        namespace: String,
        /// Import name.
        name: String,
    },

    /// The runtime is not in a servable state.
    #[error("Runtime \"{vm}\" not ready: {reason}")]
    NotReady {
        /// VM name.
        vm: String,
        /// Current state description.
        reason: String,
    },

    /// The engine rejected the import vector or the start function trapped.
    #[error("Failed to instantiate \"{module}\" module: {reason}")]
    InstantiationFailed {
        /// Module name.
        module: String,
        /// Engine-reported reason.
        reason: String,
    },

    /// The requested export does not exist or is not a function.
    #[error("Export \"{name}\" not found in module \"{module}\"")]
    ExportNotFound {
        /// Module name.
        module: String,
        /// Export name.
        name: String,
    },

    /// The caller's expectations do not match the export's signature.
    #[error("Arity mismatch calling \"{name}\": expected {expected} {what}, found {found}")]
    ArityMismatch {
        /// Export name.
        name: String,
        /// "params" or "results".
        what: &'static str,
        /// What the caller supplied or expected.
        expected: usize,
        /// What the export declares.
        found: usize,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },

    /// Execution exhausted the configured fuel limit.
    ///
    /// This indicates the WebAssembly code consumed more CPU cycles
    /// than allowed by the fuel metering configuration.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Decoding or encoding a pairs buffer failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from host function implementations.
///
/// A host function returning one of these traps the calling guest; the
/// trap message carries the error text.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The guest passed a region outside of its linear memory.
    #[error("Memory access out of bounds: offset {offset}, len {len}, memory size {size}")]
    MemoryAccess {
        /// Start offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Current memory size.
        size: usize,
    },

    /// The calling instance exports no memory.
    #[error("Memory export not found in guest module \"{module}\"")]
    MissingMemory {
        /// Module name.
        module: String,
    },

    /// The pairs codec rejected the data.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Errors from the pairs wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ends before the declared content.
    #[error("Truncated buffer: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes needed to continue decoding.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// The output buffer cannot hold the encoded collection.
    #[error("Buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall {
        /// Bytes needed.
        needed: usize,
        /// Buffer capacity.
        available: usize,
    },

    /// A length does not fit in the 4-byte wire field.
    #[error("Length {len} does not fit in a u32 field")]
    LengthOverflow {
        /// The offending length.
        len: usize,
    },

    /// Allocating the decoded collection failed.
    #[error("Allocation of {requested} entries failed")]
    Allocation {
        /// Number of entries (or bytes) requested.
        requested: usize,
    },
}

impl RuntimeError {
    /// Create a new `ModuleNotFound` error.
    pub fn module_not_found(module_id: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module_id: module_id.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error without a trap code.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
            code: None,
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `UnsupportedModule` error.
    pub fn unsupported(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedModule {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ExportNotFound {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Returns `true` if this error indicates a missing module or export.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound { .. }
                | Self::ExportNotFound { .. }
                | Self::HostInterfaceNotFound { .. }
        )
    }

    /// Returns `true` if guest execution was aborted.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap { .. } | Self::FuelExhausted)
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted)
    }

    /// Returns `true` for load-phase errors that must abort startup.
    pub fn is_fatal_to_startup(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::ModuleAlreadyExists { .. }
                | Self::CompilationFailed { .. }
                | Self::UnsupportedModule { .. }
                | Self::Io(_)
        )
    }
}
