//! Host interfaces and the per-call view host functions receive.
//!
//! A [`HostInterface`] is a named set of [`HostFunction`]s that guests can
//! import. Linking a module against an interface picks one host function
//! per import; instantiation then wraps each of them in a trampoline
//! (see [`crate::trampoline`]).
//!
//! Host functions receive a [`HostCall`]: the store data of the calling
//! execution context plus the calling instance, for linear memory access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use wasmtime::{Caller, Engine, Extern, FuncType, Memory, Val, ValType};

use wasmbind_common::HostFunctionError;

use crate::module::ENV_NAMESPACE;
use crate::store::ContextData;
use crate::trampoline::InstanceBinding;

type HostFn =
    dyn Fn(&mut HostCall<'_, '_>, &[Val], &mut [Val]) -> Result<(), HostFunctionError> + Send + Sync;

/// A native function guests can import.
pub struct HostFunction {
    namespace: String,
    name: String,
    params: Vec<ValType>,
    results: Vec<ValType>,
    callback: Box<HostFn>,
}

impl HostFunction {
    /// Create a host function in the `env` namespace.
    pub fn new<F>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
        callback: F,
    ) -> Self
    where
        F: Fn(&mut HostCall<'_, '_>, &[Val], &mut [Val]) -> Result<(), HostFunctionError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            namespace: ENV_NAMESPACE.to_string(),
            name: name.into(),
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
            callback: Box::new(callback),
        }
    }

    /// Move the function to another import namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine-level signature of this function.
    pub fn func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(engine, self.params.iter().cloned(), self.results.iter().cloned())
    }

    pub(crate) fn invoke(
        &self,
        call: &mut HostCall<'_, '_>,
        params: &[Val],
        results: &mut [Val],
    ) -> Result<(), HostFunctionError> {
        (self.callback)(call, params, results)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("params", &self.params.len())
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

/// A named set of host functions, keyed by (namespace, name).
#[derive(Debug, Clone)]
pub struct HostInterface {
    name: String,
    funcs: BTreeMap<(String, String), Arc<HostFunction>>,
}

impl HostInterface {
    /// Create an empty interface.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: BTreeMap::new(),
        }
    }

    /// Add a function, replacing any previous one with the same key.
    pub fn define(&mut self, func: HostFunction) -> &mut Self {
        let key = (func.namespace.clone(), func.name.clone());
        self.funcs.insert(key, Arc::new(func));
        self
    }

    /// Builder-style [`Self::define`].
    #[must_use]
    pub fn with(mut self, func: HostFunction) -> Self {
        self.define(func);
        self
    }

    /// Copy every function of `other` into this interface.
    #[must_use]
    pub fn merge(mut self, other: &HostInterface) -> Self {
        for (key, func) in &other.funcs {
            self.funcs.insert(key.clone(), Arc::clone(func));
        }
        self
    }

    /// Find the function satisfying an import.
    pub fn resolve(&self, namespace: &str, name: &str) -> Option<Arc<HostFunction>> {
        self.funcs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Returns `true` if a function is defined under this key.
    pub fn provides(&self, namespace: &str, name: &str) -> bool {
        self.funcs
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Functions in (namespace, name) order.
    pub fn functions(&self) -> impl Iterator<Item = &Arc<HostFunction>> {
        self.funcs.values()
    }
}

/// What a host function sees of its caller.
///
/// Carries the calling instance explicitly, so nested calls coming from
/// different instances of one context each see their own memory.
pub struct HostCall<'a, 'b> {
    caller: Caller<'a, ContextData>,
    instance: &'b InstanceBinding,
}

impl<'a, 'b> HostCall<'a, 'b> {
    pub(crate) fn new(caller: Caller<'a, ContextData>, instance: &'b InstanceBinding) -> Self {
        Self { caller, instance }
    }

    /// Store data of the calling execution context.
    pub fn data(&self) -> &ContextData {
        self.caller.data()
    }

    /// Mutable store data of the calling execution context.
    pub fn data_mut(&mut self) -> &mut ContextData {
        self.caller.data_mut()
    }

    /// Name of the module whose instance made this call.
    pub fn module_name(&self) -> &str {
        self.instance.module_name()
    }

    /// Linear memory of the calling instance.
    ///
    /// While the instance's start function runs, the memory is not yet
    /// recorded on the instance and is fetched from the caller's exports.
    pub fn memory(&mut self) -> Result<Memory, HostFunctionError> {
        if let Some(memory) = self.instance.memory() {
            return Ok(memory);
        }

        self.instance
            .memory_name()
            .and_then(|name| self.caller.get_export(name))
            .and_then(Extern::into_memory)
            .ok_or_else(|| HostFunctionError::MissingMemory {
                module: self.instance.module_name().to_string(),
            })
    }

    /// Copy `len` bytes out of guest memory.
    pub fn read_memory(&mut self, offset: i32, len: i32) -> Result<Vec<u8>, HostFunctionError> {
        let (start, len) = checked_region(offset, len)?;
        let memory = self.memory()?;
        let data = memory.data(&self.caller);

        let range = bounded(start, len, data.len())?;
        Ok(data[range].to_vec())
    }

    /// Copy `bytes` into guest memory at `offset`.
    pub fn write_memory(&mut self, offset: i32, bytes: &[u8]) -> Result<(), HostFunctionError> {
        let (start, _) = checked_region(offset, 0)?;
        let memory = self.memory()?;
        let data = memory.data_mut(&mut self.caller);

        let range = bounded(start, bytes.len(), data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Run `f` over a mutable window of guest memory.
    pub fn with_memory_mut<R>(
        &mut self,
        offset: i32,
        len: i32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, HostFunctionError> {
        let (start, len) = checked_region(offset, len)?;
        let memory = self.memory()?;
        let data = memory.data_mut(&mut self.caller);

        let range = bounded(start, len, data.len())?;
        Ok(f(&mut data[range]))
    }
}

#[allow(clippy::cast_sign_loss)]
fn checked_region(offset: i32, len: i32) -> Result<(usize, usize), HostFunctionError> {
    if offset < 0 || len < 0 {
        return Err(HostFunctionError::InvalidArgument {
            reason: format!("negative pointer or length ({offset}, {len})"),
        });
    }
    Ok((offset as usize, len as usize))
}

fn bounded(
    start: usize,
    len: usize,
    size: usize,
) -> Result<std::ops::Range<usize>, HostFunctionError> {
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start..end),
        _ => Err(HostFunctionError::MemoryAccess {
            offset: start,
            len,
            size,
        }),
    }
}
