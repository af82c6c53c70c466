//! Live instances of linked modules.
//!
//! An [`Instance`] is created by its execution context the first time a
//! linked module is used there, and lives exactly as long as that context.
//! Calls go through [`InstanceMut`], which pairs the instance with the
//! context's store:
//!
//! 1. Resolve the export (by name or pre-resolved [`ExportedFunc`])
//! 2. Check arity against the export's signature
//! 3. Re-arm fuel and the epoch deadline, then call
//! 4. Record metrics and map traps to [`RuntimeError`]

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, instrument, warn};
use uuid::Uuid;
use wasmtime::{Extern, Memory, Store, Trap, Val};

use wasmbind_common::{ExecutionConfig, HostFunctionError, RuntimeError};

use crate::WasmEngine;
use crate::linker::LinkedModule;
use crate::module::{ExportedFunc, Module};
use crate::store::{ContextData, begin_call, end_call};
use crate::trampoline::{InstanceBinding, TrampolineCtx};

/// An instantiated linked module, owned by one execution context.
pub struct Instance {
    id: Uuid,
    linked: Arc<LinkedModule>,
    inner: wasmtime::Instance,
    exports: Vec<Extern>,
    binding: Arc<InstanceBinding>,
    tctxs: Vec<Arc<TrampolineCtx>>,
}

impl Instance {
    /// Instantiate `linked` in `store`.
    ///
    /// Trampolines are built first, with their instance half left empty
    /// until the engine instance exists.
    pub(crate) fn new(
        store: &mut Store<ContextData>,
        linked: &Arc<LinkedModule>,
    ) -> Result<Self, RuntimeError> {
        let module = linked.module();
        let binding = Arc::new(InstanceBinding::new(module));

        let tctxs: Vec<_> = linked
            .bindings()
            .iter()
            .map(|hfunc| TrampolineCtx::new(Arc::clone(hfunc), Arc::clone(&binding)))
            .collect();

        let imports: Vec<Extern> = tctxs
            .iter()
            .map(|tctx| Extern::Func(tctx.to_func(store)))
            .collect();

        let inner = wasmtime::Instance::new(&mut *store, module.inner(), &imports).map_err(|e| {
            let (message, _) = extract_trap_info(&e);
            RuntimeError::instantiation_failed(module.name(), message)
        })?;

        let exports: Vec<Extern> = inner
            .exports(&mut *store)
            .map(wasmtime::Export::into_extern)
            .collect();

        if let Some(decl) = module.memory_export() {
            match exports.get(decl.index).cloned().and_then(Extern::into_memory) {
                Some(memory) => binding.bind_memory(memory),
                None => {
                    return Err(RuntimeError::instantiation_failed(
                        module.name(),
                        format!("memory export \"{}\" missing from instance", decl.name),
                    ));
                }
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            linked: Arc::clone(linked),
            inner,
            exports,
            binding,
            tctxs,
        })
    }

    /// Unique identity of this instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn linked(&self) -> &Arc<LinkedModule> {
        &self.linked
    }

    pub fn module(&self) -> &Module {
        self.linked.module()
    }

    /// Exported memory, if the module has one.
    pub fn memory(&self) -> Option<Memory> {
        self.binding.memory()
    }

    /// Export by declaration index.
    pub fn export(&self, index: usize) -> Option<&Extern> {
        self.exports.get(index)
    }

    /// Names of the host functions this instance imports, in import order.
    pub fn host_functions(&self) -> impl Iterator<Item = &str> {
        self.tctxs.iter().map(|tctx| tctx.host_function().name())
    }

    pub fn inner(&self) -> &wasmtime::Instance {
        &self.inner
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("module", &self.module().name())
            .field("index", &self.linked.index())
            .field("memory", &self.binding.memory().is_some())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for InstanceMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceMut")
            .field("instance", self.instance)
            .finish_non_exhaustive()
    }
}

/// An instance together with the store of its context.
pub struct InstanceMut<'a> {
    pub(crate) store: &'a mut Store<ContextData>,
    pub(crate) instance: &'a Instance,
    pub(crate) engine: &'a WasmEngine,
    pub(crate) config: &'a ExecutionConfig,
}

impl InstanceMut<'_> {
    pub fn instance(&self) -> &Instance {
        self.instance
    }

    pub fn data(&self) -> &ContextData {
        self.store.data()
    }

    pub fn data_mut(&mut self) -> &mut ContextData {
        self.store.data_mut()
    }

    /// Call an export by name, expecting `nresults` results.
    pub fn call(
        &mut self,
        name: &str,
        args: &[Val],
        nresults: usize,
    ) -> Result<Vec<Val>, RuntimeError> {
        let module = self.instance.module();
        let func = module
            .func_lookup(name)
            .cloned()
            .ok_or_else(|| RuntimeError::export_not_found(module.name(), name))?;

        self.call_func(&func, args, nresults)
    }

    /// Call a pre-resolved export.
    ///
    /// # Panics
    ///
    /// Panics if `func` was resolved on another module.
    #[instrument(
        skip(self, func, args),
        fields(module = %self.instance.module().name(), export = %func.name())
    )]
    pub fn call_func(
        &mut self,
        func: &ExportedFunc,
        args: &[Val],
        nresults: usize,
    ) -> Result<Vec<Val>, RuntimeError> {
        let module = self.instance.module();

        assert_eq!(
            func.module_id(),
            module.id(),
            "export \"{}\" called on an instance of \"{}\"",
            func.name(),
            module.name()
        );

        let f = self
            .instance
            .export(func.index())
            .cloned()
            .and_then(Extern::into_func)
            .ok_or_else(|| RuntimeError::export_not_found(module.name(), func.name()))?;

        let ty = f.ty(&*self.store);

        if ty.params().len() != args.len() {
            return Err(RuntimeError::ArityMismatch {
                name: func.name().to_string(),
                what: "params",
                expected: args.len(),
                found: ty.params().len(),
            });
        }

        if ty.results().len() != nresults {
            return Err(RuntimeError::ArityMismatch {
                name: func.name().to_string(),
                what: "results",
                expected: nresults,
                found: ty.results().len(),
            });
        }

        let mut results = vec![Val::I32(0); nresults];
        let initial_fuel = begin_call(self.store, self.engine, self.config)?;
        let start = Instant::now();

        let result = f.call(&mut *self.store, args, &mut results);

        let fuel_consumed = end_call(self.store, initial_fuel, result.is_err());
        let duration = start.elapsed();

        match result {
            Ok(()) => {
                debug!(
                    duration_us = duration.as_micros(),
                    fuel_consumed, "call completed"
                );
                Ok(results)
            }
            Err(e) if is_out_of_fuel(&e) => {
                warn!(
                    duration_ms = duration.as_millis(),
                    fuel_consumed, "call terminated: fuel exhausted"
                );
                Err(RuntimeError::FuelExhausted)
            }
            Err(e) => {
                let (message, code) = extract_trap_info(&e);

                error!(
                    duration_ms = duration.as_millis(),
                    fuel_consumed,
                    trap_message = %message,
                    "call trapped"
                );

                Err(RuntimeError::Trap { message, code })
            }
        }
    }

    /// Copy bytes out of the instance's memory.
    pub fn memory_read(&self, offset: usize, len: usize) -> Result<Vec<u8>, RuntimeError> {
        let memory = self.require_memory()?;
        let data = memory.data(&*self.store);

        let range = memory_range(offset, len, data.len())?;
        Ok(data[range].to_vec())
    }

    /// Copy bytes into the instance's memory.
    pub fn memory_write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), RuntimeError> {
        let memory = self.require_memory()?;
        let data = memory.data_mut(&mut *self.store);

        let range = memory_range(offset, bytes.len(), data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn require_memory(&self) -> Result<Memory, RuntimeError> {
        self.instance.memory().ok_or_else(|| {
            HostFunctionError::MissingMemory {
                module: self.instance.module().name().to_string(),
            }
            .into()
        })
    }
}

fn memory_range(
    offset: usize,
    len: usize,
    size: usize,
) -> Result<std::ops::Range<usize>, RuntimeError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(HostFunctionError::MemoryAccess { offset, len, size }.into()),
    }
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = format!("{error:#}");

    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));

    (message, code)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_range() {
        assert_eq!(memory_range(0, 4, 4).unwrap(), 0..4);
        assert!(memory_range(2, 4, 4).is_err());
        assert!(memory_range(usize::MAX, 1, 4).is_err());
    }

    #[test]
    fn test_trap_info() {
        let err = wasmtime::Error::new(Trap::UnreachableCodeReached);
        let (message, code) = extract_trap_info(&err);

        assert!(!message.is_empty());
        assert_eq!(code.as_deref(), Some("UnreachableCodeReached"));
        assert!(!is_out_of_fuel(&err));
        assert!(is_out_of_fuel(&wasmtime::Error::new(Trap::OutOfFuel)));
    }
}
