//! Logging host function implementation.
//!
//! This module provides the host side of `env.log`, allowing guests to emit
//! logs that are captured by their execution context.

use tracing::{debug, error, info, warn};
use wasmtime::ValType;

use wasmbind_core::store::{ContextData, LogLevel};
use wasmbind_core::HostFunction;

use crate::interfaces::arg_i32;

/// Host implementation for the logging interface.
///
/// Logs are both:
/// 1. Stored in the [`ContextData`] for later retrieval
/// 2. Emitted via the `tracing` crate for observability
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level on behalf of `module`.
    pub fn log(ctx: &mut ContextData, module: &str, level: LogLevel, message: &str) {
        ctx.log(level, module, message.to_string());

        let scope = ctx.scope_id;
        match level {
            LogLevel::Debug => debug!(%scope, module, guest_log = true, "{}", message),
            LogLevel::Info => info!(%scope, module, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(%scope, module, guest_log = true, "{}", message),
            LogLevel::Error => error!(%scope, module, guest_log = true, "{}", message),
        }
    }

    /// `env.log(level: i32, ptr: i32, len: i32)`.
    ///
    /// The message is UTF-8 read from the calling instance's memory; invalid
    /// sequences are replaced rather than rejected.
    pub fn function() -> HostFunction {
        HostFunction::new(
            "log",
            [ValType::I32, ValType::I32, ValType::I32],
            [],
            |call, params, _results| {
                let level = level_from_i32(arg_i32(params, 0)?);
                let bytes = call.read_memory(arg_i32(params, 1)?, arg_i32(params, 2)?)?;
                let message = String::from_utf8_lossy(&bytes);

                let module = call.module_name().to_string();
                Self::log(call.data_mut(), &module, level, &message);
                Ok(())
            },
        )
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// 0=debug, 1=info, 2=warn, 3=error; unknown values map to info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wasmbind_common::ExecutionConfig;

    fn ctx() -> ContextData {
        ContextData::new(Uuid::new_v4(), &ExecutionConfig::default())
    }

    #[test]
    fn test_logging_stores_in_context() {
        let mut ctx = ctx();

        LoggingHost::log(&mut ctx, "m", LogLevel::Info, "Hello");
        LoggingHost::log(&mut ctx, "m", LogLevel::Error, "World");

        assert_eq!(ctx.logs.len(), 2);
        assert_eq!(ctx.logs[0].message, "Hello");
        assert_eq!(ctx.logs[0].module, "m");
        assert_eq!(ctx.logs[0].level, LogLevel::Info);
        assert_eq!(ctx.logs[1].message, "World");
        assert_eq!(ctx.logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }

    #[test]
    fn test_function_signature() {
        let func = LoggingHost::function();
        assert_eq!(func.namespace(), "env");
        assert_eq!(func.name(), "log");
    }
}
