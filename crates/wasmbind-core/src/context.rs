//! Execution contexts.
//!
//! An [`ExecutionContext`] is one scope (a request, a session, a timer
//! root) with its own store and one instance slot per linked module.
//! Instances are created on first use and reused afterwards; destroying
//! the context destroys all of them.

use std::sync::Arc;

use tracing::{debug, error, info_span};
use uuid::Uuid;
use wasmtime::{Store, Val};

use wasmbind_common::{ExecutionConfig, RuntimeError};

use crate::WasmEngine;
use crate::instance::{Instance, InstanceMut};
use crate::linker::LinkedModule;
use crate::store::{ContextData, begin_call, create_store};

/// A scope owning a store and at most one instance per linked module.
pub struct ExecutionContext {
    vm: String,
    id: Uuid,
    engine: WasmEngine,
    config: ExecutionConfig,
    store: Store<ContextData>,
    slots: Vec<Option<Instance>>,
}

impl ExecutionContext {
    /// Create a context with room for `nslots` linked modules.
    ///
    /// Slots for modules linked later are added on demand.
    pub fn new(
        vm: &str,
        engine: &WasmEngine,
        config: &ExecutionConfig,
        nslots: usize,
    ) -> Result<Self, RuntimeError> {
        let id = Uuid::new_v4();
        let store = create_store(engine, config, id)?;

        debug!(vm, ctx = %id, slots = nslots, "execution context created");

        Ok(Self {
            vm: vm.to_string(),
            id,
            engine: engine.clone(),
            config: config.clone(),
            store,
            slots: std::iter::repeat_with(|| None).take(nslots).collect(),
        })
    }

    /// Scope identifier, also found in the store data.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the runtime this context belongs to.
    pub fn vm(&self) -> &str {
        &self.vm
    }

    /// The existing instance of `linked`, or a new one.
    ///
    /// A failed instantiation leaves the slot empty; other slots and the
    /// context itself stay usable.
    pub fn get_or_create_instance(
        &mut self,
        linked: &Arc<LinkedModule>,
    ) -> Result<InstanceMut<'_>, RuntimeError> {
        let index = linked.index();
        let module = linked.module().name();

        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }

        let instance = match self.slots[index].take() {
            Some(instance) => {
                debug!(
                    vm = %self.vm,
                    ctx = %self.id,
                    module,
                    "reusing instance"
                );
                instance
            }
            None => {
                debug!(
                    vm = %self.vm,
                    ctx = %self.id,
                    module,
                    "creating instance"
                );

                // Start functions run on the same per-call budget as exports
                begin_call(&mut self.store, &self.engine, &self.config)?;

                match Instance::new(&mut self.store, linked) {
                    Ok(instance) => {
                        self.store.data_mut().metrics.instances += 1;
                        instance
                    }
                    Err(e) => {
                        error!(
                            vm = %self.vm,
                            ctx = %self.id,
                            module,
                            error = %e,
                            "failed to create instance"
                        );
                        return Err(e);
                    }
                }
            }
        };

        let instance = self.slots[index].insert(instance);

        Ok(InstanceMut {
            store: &mut self.store,
            instance,
            engine: &self.engine,
            config: &self.config,
        })
    }

    /// The instance of `linked`, if one was created in this context.
    pub fn instance(&self, linked: &LinkedModule) -> Option<&Instance> {
        self.slots.get(linked.index()).and_then(Option::as_ref)
    }

    /// Call `export` on the instance of `linked`, creating it if needed.
    ///
    /// The number of results is taken from the export's signature.
    pub fn call(
        &mut self,
        linked: &Arc<LinkedModule>,
        export: &str,
        args: &[Val],
    ) -> Result<Vec<Val>, RuntimeError> {
        let span = info_span!("call", vm = %self.vm, module = %linked.module().name(), export);
        let _guard = span.enter();

        let mut instance = self.get_or_create_instance(linked)?;

        let nresults = instance
            .instance()
            .module()
            .inner()
            .get_export(export)
            .and_then(|ty| ty.func().map(|f| f.results().len()))
            .ok_or_else(|| {
                RuntimeError::export_not_found(linked.module().name(), export)
            })?;

        instance.call(export, args, nresults)
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn data(&self) -> &ContextData {
        self.store.data()
    }

    pub fn data_mut(&mut self) -> &mut ContextData {
        self.store.data_mut()
    }

    /// Destroy every instance, then the store.
    ///
    /// Consumes the context, so it can only happen once. Returns the
    /// store data for inspection.
    pub fn destroy(mut self) -> ContextData {
        for instance in self.slots.drain(..).flatten() {
            debug!(
                vm = %self.vm,
                ctx = %self.id,
                module = %instance.module().name(),
                "freeing instance"
            );
            drop(instance);
        }

        let mut data = self.store.into_data();
        data.finalize_metrics();

        debug!(vm = %self.vm, ctx = %self.id, "execution context destroyed");

        data
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("vm", &self.vm)
            .field("id", &self.id)
            .field("slots", &self.slots.len())
            .field("instances", &self.instance_count())
            .finish_non_exhaustive()
    }
}
