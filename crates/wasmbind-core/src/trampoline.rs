//! Host function trampolines.
//!
//! Each host-function binding of an instance gets a [`TrampolineCtx`]
//! pairing the native function with the instance that imported it. The
//! context is captured by the closure handed to the engine, so a guest call
//! is routed without any global "current instance" lookup.
//!
//! The instance side is filled in two phases: the trampoline contexts must
//! exist before instantiation (they form the import vector) while the
//! instance's memory is only known afterwards.

use std::sync::{Arc, OnceLock};

use tracing::warn;
use wasmtime::{Func, Memory, Store};

use crate::host::{HostCall, HostFunction};
use crate::module::Module;
use crate::store::ContextData;

/// The instance half of a trampoline context.
#[derive(Debug)]
pub(crate) struct InstanceBinding {
    module_name: String,
    memory_name: Option<String>,
    memory: OnceLock<Memory>,
}

impl InstanceBinding {
    pub(crate) fn new(module: &Module) -> Self {
        Self {
            module_name: module.name().to_string(),
            memory_name: module.memory_export().map(|export| export.name.clone()),
            memory: OnceLock::new(),
        }
    }

    pub(crate) fn module_name(&self) -> &str {
        &self.module_name
    }

    pub(crate) fn memory_name(&self) -> Option<&str> {
        self.memory_name.as_deref()
    }

    pub(crate) fn memory(&self) -> Option<Memory> {
        self.memory.get().copied()
    }

    /// Second phase: record the memory once instantiation succeeded.
    /// Instantiation runs once per binding.
    pub(crate) fn bind_memory(&self, memory: Memory) {
        let bound = self.memory.set(memory);
        debug_assert!(bound.is_ok(), "memory bound twice for {}", self.module_name);
    }
}

/// {host function, instance} pair behind one imported function.
#[derive(Debug)]
pub(crate) struct TrampolineCtx {
    hfunc: Arc<HostFunction>,
    instance: Arc<InstanceBinding>,
}

impl TrampolineCtx {
    pub(crate) fn new(hfunc: Arc<HostFunction>, instance: Arc<InstanceBinding>) -> Arc<Self> {
        Arc::new(Self { hfunc, instance })
    }

    /// Wrap this context into an engine function living in `store`.
    pub(crate) fn to_func(self: &Arc<Self>, store: &mut Store<ContextData>) -> Func {
        let ty = self.hfunc.func_type(store.engine());
        let tctx = Arc::clone(self);

        Func::new(&mut *store, ty, move |caller, params, results| {
            let mut call = HostCall::new(caller, &tctx.instance);

            tctx.hfunc
                .invoke(&mut call, params, results)
                .map_err(|e| {
                    warn!(
                        module = %tctx.instance.module_name(),
                        host_function = %tctx.hfunc.name(),
                        error = %e,
                        "host function failed"
                    );
                    wasmtime::Error::new(e)
                })
        })
    }

    pub(crate) fn host_function(&self) -> &HostFunction {
        &self.hfunc
    }
}
