//! The host interfaces shipped with wasmbind.
//!
//! - `core`: `env.log`; installed as the runtime's core interface so every
//!   link can fall back to it
//! - `pairs`: `env.get_map_size`, `env.get_map`, `env.set_map` plus core

use wasmtime::Val;

use wasmbind_common::{HostFunctionError, RuntimeError};
use wasmbind_core::{HostInterface, Runtime};

use crate::logging::LoggingHost;
use crate::maps;

/// Name of the core interface.
pub const CORE: &str = "core";

/// Name of the pairs interface.
pub const PAIRS: &str = "pairs";

/// `i32` argument at `index`.
pub(crate) fn arg_i32(params: &[Val], index: usize) -> Result<i32, HostFunctionError> {
    params
        .get(index)
        .and_then(Val::i32)
        .ok_or_else(|| HostFunctionError::InvalidArgument {
            reason: format!("expected i32 argument at position {index}"),
        })
}

/// The core interface.
pub fn core_interface() -> HostInterface {
    HostInterface::new(CORE).with(LoggingHost::function())
}

/// The pairs interface, core functions included.
pub fn pairs_interface() -> HostInterface {
    maps::functions()
        .into_iter()
        .fold(HostInterface::new(PAIRS), HostInterface::with)
        .merge(&core_interface())
}

/// Install `core` as the core interface and register both interfaces.
///
/// # Errors
///
/// Returns an error if an interface with the same name is already
/// registered or the runtime is shut down.
pub fn register_all(runtime: &mut Runtime) -> Result<(), RuntimeError> {
    runtime.set_core_host(core_interface());
    runtime.register_host_interface(core_interface())?;
    runtime.register_host_interface(pairs_interface())?;
    Ok(())
}
