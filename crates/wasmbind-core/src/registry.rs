//! Module registry.
//!
//! The [`ModuleRegistry`] owns every module of one runtime, keyed by unique
//! name. Modules are either loaded eagerly with [`ModuleRegistry::add`] or
//! registered with [`ModuleRegistry::register`] and compiled together by
//! [`ModuleRegistry::load_all`], which is all-or-nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};
use wasmtime::Engine;

use wasmbind_common::RuntimeError;

use crate::module::{Module, ModuleSource};

/// Name-keyed collection of loaded and pending modules.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    pending: BTreeMap<String, ModuleSource>,
    modules: BTreeMap<String, Arc<Module>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_name(&self, name: &str) -> Result<(), RuntimeError> {
        if name.is_empty() {
            return Err(RuntimeError::invalid_config("invalid module name \"\""));
        }

        if self.pending.contains_key(name) || self.modules.contains_key(name) {
            return Err(RuntimeError::ModuleAlreadyExists {
                name: name.to_string(),
            });
        }

        Ok(())
    }

    /// Register a module for deferred compilation by [`Self::load_all`].
    pub fn register(&mut self, name: &str, source: ModuleSource) -> Result<(), RuntimeError> {
        self.check_name(name)?;

        debug!(module = name, locator = %source.locator(), "adding module");

        self.pending.insert(name.to_string(), source);
        Ok(())
    }

    /// Load and compile a module immediately.
    pub fn add(
        &mut self,
        engine: &Engine,
        name: &str,
        source: &ModuleSource,
    ) -> Result<Arc<Module>, RuntimeError> {
        self.check_name(name)?;

        let module = Arc::new(Module::load(engine, name, source)?);
        self.modules.insert(name.to_string(), Arc::clone(&module));

        Ok(module)
    }

    /// Compile every pending module, in name order.
    ///
    /// On the first failure the whole registry is cleared: a registry with
    /// only some modules loaded is never handed out.
    pub fn load_all(&mut self, engine: &Engine) -> Result<(), RuntimeError> {
        let pending = std::mem::take(&mut self.pending);

        for (name, source) in pending {
            match Module::load(engine, &name, &source) {
                Ok(module) => {
                    self.modules.insert(name, Arc::new(module));
                }
                Err(e) => {
                    error!(module = %name, error = %e, "failed loading module");
                    self.clear();
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Look up a loaded module by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<Module>, RuntimeError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::module_not_found(name))
    }

    /// Loaded modules in name order.
    pub fn modules(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.modules.values()
    }

    /// Number of modules awaiting [`Self::load_all`].
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of loaded modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if nothing is loaded or pending.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.pending.is_empty()
    }

    /// Drop every module, loaded or pending.
    pub fn clear(&mut self) {
        for name in self.modules.keys() {
            debug!(module = %name, "freeing module");
        }
        self.modules.clear();
        self.pending.clear();
    }
}
