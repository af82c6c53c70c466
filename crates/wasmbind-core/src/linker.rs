//! Binding module imports to host interfaces.
//!
//! [`link`] turns a [`Module`] and a [`HostInterface`] into a
//! [`LinkedModule`]: an immutable, ordered list of host functions, one per
//! function import, ready to become the import vector of any number of
//! instances. Every linked module gets a dense index, unique for the
//! lifetime of its runtime, which execution contexts use as a slot number.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error};

use wasmbind_common::RuntimeError;

use crate::host::{HostFunction, HostInterface};
use crate::module::{ExternKind, Module};

/// A module bound to the host functions satisfying its imports.
pub struct LinkedModule {
    index: usize,
    module: Arc<Module>,
    host: String,
    bindings: Vec<Arc<HostFunction>>,
}

impl LinkedModule {
    /// Slot index, unique within the runtime.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Name of the interface the module was linked with.
    pub fn host_name(&self) -> &str {
        &self.host
    }

    /// Host functions in import order.
    pub fn bindings(&self) -> &[Arc<HostFunction>] {
        &self.bindings
    }
}

impl fmt::Debug for LinkedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedModule")
            .field("index", &self.index)
            .field("module", &self.module.name())
            .field("host", &self.host)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Resolve every import of `module` against `host`, falling back to `core`.
///
/// Either every import resolves or no linked module is produced; a failed
/// link does not consume an index.
///
/// # Errors
///
/// - `MissingImport` if no interface provides a function import
/// - `UnsupportedModule` for non-function imports
pub fn link(
    module: &Arc<Module>,
    host: &HostInterface,
    core: Option<&HostInterface>,
    next_index: &AtomicUsize,
) -> Result<LinkedModule, RuntimeError> {
    let total = module.imports().len();
    let mut bindings = Vec::with_capacity(total);

    for (i, import) in module.imports().iter().enumerate() {
        debug!(
            module = %module.name(),
            host = %host.name(),
            "linking module import \"{}.{}\" ({}/{})",
            import.namespace,
            import.name,
            i + 1,
            total
        );

        let result = if import.kind == ExternKind::Func {
            host.resolve(&import.namespace, &import.name)
                .or_else(|| core.and_then(|core| core.resolve(&import.namespace, &import.name)))
                .ok_or_else(|| RuntimeError::MissingImport {
                    module: module.name().to_string(),
                    namespace: import.namespace.clone(),
                    name: import.name.clone(),
                })
        } else {
            Err(RuntimeError::unsupported(
                module.name(),
                format!(
                    "{} import \"{}.{}\" cannot be provided by a host interface",
                    import.kind, import.namespace, import.name
                ),
            ))
        };

        match result {
            Ok(hfunc) => bindings.push(hfunc),
            Err(e) => {
                error!(
                    module = %module.name(),
                    host = %host.name(),
                    error = %e,
                    "failed linking module with host interface"
                );
                return Err(e);
            }
        }
    }

    let index = next_index.fetch_add(1, Ordering::Relaxed);

    debug!(
        module = %module.name(),
        host = %host.name(),
        index,
        bindings = bindings.len(),
        "module linked"
    );

    Ok(LinkedModule {
        index,
        module: Arc::clone(module),
        host: host.name().to_string(),
        bindings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use crate::module::ModuleSource;
    use wasmbind_common::EngineConfig;
    use wasmtime::ValType;

    fn load(wat: &str) -> Arc<Module> {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        Arc::new(Module::load(engine.inner(), "m", &ModuleSource::Wat(wat.into())).unwrap())
    }

    fn func(name: &str) -> HostFunction {
        HostFunction::new(name, [ValType::I32], [], |_, _, _| Ok(()))
    }

    const IMPORTS: &str = r#"
        (module
            (import "env" "a" (func (param i32)))
            (import "env" "log" (func (param i32)))
            (import "env" "b" (func (param i32)))
        )
    "#;

    #[test]
    fn test_link_with_core_fallback() {
        let module = load(IMPORTS);
        let host = HostInterface::new("test").with(func("a")).with(func("b"));
        let core = HostInterface::new("core").with(func("log")).with(func("a"));
        let next = AtomicUsize::new(0);

        let linked = link(&module, &host, Some(&core), &next).unwrap();

        assert_eq!(linked.index(), 0);
        assert_eq!(linked.host_name(), "test");
        let names: Vec<_> = linked.bindings().iter().map(|f| f.name()).collect();
        assert_eq!(names, ["a", "log", "b"]);

        // Primary interface wins over core
        assert!(Arc::ptr_eq(
            &linked.bindings()[0],
            &host.resolve("env", "a").unwrap()
        ));
    }

    #[test]
    fn test_link_missing_import() {
        let module = load(IMPORTS);
        let host = HostInterface::new("test").with(func("a")).with(func("b"));
        let next = AtomicUsize::new(0);

        let err = link(&module, &host, None, &next).unwrap_err();
        assert!(
            matches!(&err, RuntimeError::MissingImport { name, .. } if name == "log"),
            "{err}"
        );
        assert_eq!(next.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_indices_are_dense_and_unique() {
        let module = load("(module)");
        let host = HostInterface::new("empty");
        let next = AtomicUsize::new(0);

        let first = link(&module, &host, None, &next).unwrap();
        let second = link(&module, &host, None, &next).unwrap();
        drop(first);
        let third = link(&module, &host, None, &next).unwrap();

        assert_eq!(second.index(), 1);
        assert_eq!(third.index(), 2);
    }

    #[test]
    fn test_non_function_import_unsupported() {
        let module = load(r#"(module (import "other" "g" (global i32)))"#);
        let next = AtomicUsize::new(0);

        let err = link(&module, &HostInterface::new("test"), None, &next).unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedModule { .. }));
    }
}
