//! The runtime facade: one named VM.
//!
//! A [`Runtime`] owns the engine, the module registry and the host
//! interfaces modules are linked against. Its lifecycle is
//!
//! 1. `Configuring`: modules and host interfaces are registered
//! 2. `Ready`: [`Runtime::initialize`] compiled everything; links and
//!    execution contexts can be created
//! 3. `ShutDown`: after [`Runtime::shutdown`] or a failed initialization

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, error, info, instrument};

use wasmbind_common::{RuntimeConfig, RuntimeError};

use crate::context::ExecutionContext;
use crate::engine::WasmEngine;
use crate::host::HostInterface;
use crate::linker::{self, LinkedModule};
use crate::module::{ENV_NAMESPACE, ExternKind, Module, ModuleSource};
use crate::registry::ModuleRegistry;
use crate::timer::ShutdownFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Configuring,
    Ready,
    ShutDown,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuring => "not initialized",
            Self::Ready => "ready",
            Self::ShutDown => "shut down",
        };
        f.write_str(s)
    }
}

/// A named VM hosting WebAssembly modules.
pub struct Runtime {
    name: String,
    engine: WasmEngine,
    config: RuntimeConfig,
    registry: ModuleRegistry,
    hosts: BTreeMap<String, HostInterface>,
    core_host: Option<HostInterface>,
    state: RuntimeState,
    next_index: AtomicUsize,
    linked: RwLock<Vec<Arc<LinkedModule>>>,
    shutdown: ShutdownFlag,
}

impl Runtime {
    /// Create a runtime and its engine.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for an empty name or an engine configuration
    /// Wasmtime rejects.
    pub fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        if config.name.is_empty() {
            return Err(RuntimeError::invalid_config("invalid vm name \"\""));
        }

        let engine = WasmEngine::new(&config.engine)?;

        debug!(vm = %config.name, "wasm vm created");

        Ok(Self {
            name: config.name.clone(),
            engine,
            config: config.clone(),
            registry: ModuleRegistry::new(),
            hosts: BTreeMap::new(),
            core_host: None,
            state: RuntimeState::Configuring,
            next_index: AtomicUsize::new(0),
            linked: RwLock::new(Vec::new()),
            shutdown: ShutdownFlag::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Flag raised by [`Self::shutdown`]; hand it to timer schedulers.
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    fn not_ready(&self) -> RuntimeError {
        RuntimeError::NotReady {
            vm: self.name.clone(),
            reason: self.state.to_string(),
        }
    }

    fn require(&self, state: RuntimeState) -> Result<(), RuntimeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.not_ready())
        }
    }

    fn require_alive(&self) -> Result<(), RuntimeError> {
        if self.state == RuntimeState::ShutDown {
            return Err(self.not_ready());
        }
        Ok(())
    }

    /// Register a module compiled by the next [`Self::initialize`].
    pub fn register_module(
        &mut self,
        name: &str,
        source: ModuleSource,
    ) -> Result<(), RuntimeError> {
        self.require_alive()?;
        self.registry.register(name, source)
    }

    /// Compile and add a module right away.
    pub fn add_module(
        &mut self,
        name: &str,
        source: &ModuleSource,
    ) -> Result<Arc<Module>, RuntimeError> {
        self.require_alive()?;
        self.registry.add(self.engine.inner(), name, source)
    }

    /// Make a host interface available to [`Self::link`].
    pub fn register_host_interface(&mut self, host: HostInterface) -> Result<(), RuntimeError> {
        self.require_alive()?;

        if self.hosts.contains_key(host.name()) {
            return Err(RuntimeError::invalid_config(format!(
                "host interface \"{}\" already registered",
                host.name()
            )));
        }

        debug!(vm = %self.name, host = %host.name(), functions = host.len(), "registering host interface");

        self.hosts.insert(host.name().to_string(), host);
        Ok(())
    }

    /// Interface consulted when a link's primary interface lacks a symbol.
    pub fn set_core_host(&mut self, host: HostInterface) {
        self.core_host = Some(host);
    }

    pub fn host_interface(&self, name: &str) -> Option<&HostInterface> {
        self.hosts.get(name)
    }

    /// Compile every pending module and become servable.
    ///
    /// Calling it again on a ready runtime compiles modules registered
    /// since. Any failure shuts the runtime down and drops every module.
    #[instrument(skip(self), fields(vm = %self.name))]
    pub fn initialize(&mut self) -> Result<(), RuntimeError> {
        self.require_alive()?;

        if self.state == RuntimeState::Configuring {
            info!("initializing \"{}\" wasm VM", self.name);
        }

        let start = Instant::now();

        let result = self
            .registry
            .load_all(self.engine.inner())
            .and_then(|()| self.check_env_imports());

        if let Err(e) = result {
            error!(error = %e, "failed to initialize wasm VM");
            self.shutdown();
            return Err(e);
        }

        self.state = RuntimeState::Ready;

        info!(
            modules = self.registry.len(),
            duration_ms = start.elapsed().as_millis(),
            "\"{}\" wasm VM initialized",
            self.name
        );

        Ok(())
    }

    /// Every `env` import must be provided by some interface.
    fn check_env_imports(&self) -> Result<(), RuntimeError> {
        let provided = |name: &str| {
            self.hosts
                .values()
                .chain(self.core_host.as_ref())
                .any(|host| host.provides(ENV_NAMESPACE, name))
        };

        for module in self.registry.modules() {
            let missing = module.imports().iter().find(|import| {
                import.namespace == ENV_NAMESPACE
                    && import.kind == ExternKind::Func
                    && !provided(&import.name)
            });

            if let Some(import) = missing {
                return Err(RuntimeError::MissingImport {
                    module: module.name().to_string(),
                    namespace: import.namespace.clone(),
                    name: import.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Look up a loaded module.
    pub fn lookup(&self, name: &str) -> Result<Arc<Module>, RuntimeError> {
        self.registry.lookup(name)
    }

    /// Link a loaded module with a registered host interface.
    ///
    /// Failure only affects this link; other modules and links are intact.
    pub fn link(&self, module: &str, host: &str) -> Result<Arc<LinkedModule>, RuntimeError> {
        self.require(RuntimeState::Ready)?;

        let module = self.registry.lookup(module)?;
        let host = self
            .hosts
            .get(host)
            .ok_or_else(|| RuntimeError::HostInterfaceNotFound {
                name: host.to_string(),
            })?;

        let linked = Arc::new(linker::link(
            &module,
            host,
            self.core_host.as_ref(),
            &self.next_index,
        )?);

        self.linked.write().push(Arc::clone(&linked));

        Ok(linked)
    }

    /// Linked modules created so far, in index order.
    pub fn linked_modules(&self) -> Vec<Arc<LinkedModule>> {
        self.linked.read().clone()
    }

    /// Create an execution context sized for every current link.
    pub fn new_context(&self) -> Result<ExecutionContext, RuntimeError> {
        self.require(RuntimeState::Ready)?;

        ExecutionContext::new(
            &self.name,
            &self.engine,
            &self.config.execution,
            self.next_index.load(Ordering::Relaxed),
        )
    }

    /// Raise the shutdown flag and drop every module and link.
    pub fn shutdown(&mut self) {
        if self.state == RuntimeState::ShutDown {
            return;
        }

        debug!(vm = %self.name, "wasm shutdown vm");

        self.shutdown.trigger();
        self.linked.write().clear();
        self.registry.clear();
        self.state = RuntimeState::ShutDown;
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("modules", &self.registry.len())
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("linked", &self.linked.read().len())
            .finish_non_exhaustive()
    }
}
