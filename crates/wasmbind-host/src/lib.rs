//! Host functions implementation for wasmbind.
//!
//! This crate provides the host interfaces guests link against. Each is a
//! [`wasmbind_core::HostInterface`] ready to be registered on a runtime.
//!
//! # Interfaces
//!
//! - [`logging`]: `env.log`, guest logging into the execution context
//! - [`maps`]: key/value maps exchanged in the pairs wire format
//! - [`interfaces`]: the `core` and `pairs` interfaces built from the above

pub mod interfaces;
pub mod logging;
pub mod maps;

pub use interfaces::{core_interface, pairs_interface, register_all};
pub use logging::LoggingHost;
pub use maps::MapType;
