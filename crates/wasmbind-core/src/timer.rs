//! Timer resumption loop.
//!
//! A [`TimerEntity`] owns a long-lived execution context and periodically
//! re-enters one export of its root instance. Each entity has at most one
//! outstanding timer: the next one is armed only after the callback
//! returned.
//!
//! ```text
//!  Idle ──schedule──▶ Scheduled ──expiry──▶ Firing ──ok──▶ Scheduled
//!   ▲                     │                   │
//!   └── shutdown / no ────┘                   └── trap ──▶ Idle
//!       callback
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};

use wasmbind_common::RuntimeError;

use crate::context::ExecutionContext;
use crate::linker::LinkedModule;

/// Process-wide "shutting down" signal observed by timer loops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Scheduled,
    Firing,
}

/// Why a timer loop ended.
#[derive(Debug)]
pub enum TimerStop {
    Shutdown,
    /// The module does not export the callback.
    NoCallback,
    /// The callback trapped or its instance could not be created.
    Failed(RuntimeError),
}

enum Tick {
    Reschedule,
    Stop(TimerStop),
}

/// A timer-driven root: a context, the linked module it runs and the
/// export to call on every tick.
pub struct TimerEntity {
    name: String,
    context: ExecutionContext,
    linked: Arc<LinkedModule>,
    callback: String,
    state: TimerState,
    firings: u64,
    stop: Option<TimerStop>,
}

impl TimerEntity {
    pub fn new(
        name: impl Into<String>,
        context: ExecutionContext,
        linked: Arc<LinkedModule>,
        callback: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            context,
            linked,
            callback: callback.into(),
            state: TimerState::Idle,
            firings: 0,
            stop: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Number of times the callback was invoked.
    pub fn firings(&self) -> u64 {
        self.firings
    }

    /// Why the loop ended, once it has.
    pub fn stop_reason(&self) -> Option<&TimerStop> {
        self.stop.as_ref()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Give the context back, e.g. to destroy it.
    pub fn into_context(self) -> ExecutionContext {
        self.context
    }

    fn fire(&mut self, shutdown: &ShutdownFlag) -> Tick {
        if shutdown.is_set() {
            return Tick::Stop(TimerStop::Shutdown);
        }

        if self.linked.module().func_lookup(&self.callback).is_none() {
            return Tick::Stop(TimerStop::NoCallback);
        }

        self.state = TimerState::Firing;
        self.firings += 1;

        debug!(callback = %self.callback, firing = self.firings, "timer firing");

        match self.context.call(&self.linked, &self.callback, &[]) {
            Ok(_) if shutdown.is_set() => Tick::Stop(TimerStop::Shutdown),
            Ok(_) => Tick::Reschedule,
            Err(e) => {
                error!(
                    callback = %self.callback,
                    error = %e,
                    "timer callback failed, not rescheduling"
                );
                Tick::Stop(TimerStop::Failed(e))
            }
        }
    }

    async fn run(mut self, period: Duration, shutdown: ShutdownFlag) -> Self {
        loop {
            self.state = TimerState::Scheduled;
            tokio::time::sleep(period).await;

            match self.fire(&shutdown) {
                Tick::Reschedule => {}
                Tick::Stop(reason) => {
                    debug!(reason = ?reason, firings = self.firings, "timer stopped");
                    self.state = TimerState::Idle;
                    self.stop = Some(reason);
                    return self;
                }
            }
        }
    }
}

impl fmt::Debug for TimerEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntity")
            .field("name", &self.name)
            .field("module", &self.linked.module().name())
            .field("callback", &self.callback)
            .field("state", &self.state)
            .field("firings", &self.firings)
            .finish_non_exhaustive()
    }
}

/// Owner of every outstanding timer loop of a runtime.
#[derive(Debug, Default)]
pub struct TimerScheduler {
    shutdown: ShutdownFlag,
    tasks: HashMap<String, JoinHandle<TimerEntity>>,
}

impl TimerScheduler {
    pub fn new(shutdown: ShutdownFlag) -> Self {
        Self {
            shutdown,
            tasks: HashMap::new(),
        }
    }

    /// Arm `entity`'s timer loop on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a zero period, for an entity whose loop is still
    /// running, or once shutdown has begun.
    pub fn schedule_timer(
        &mut self,
        entity: TimerEntity,
        period: Duration,
    ) -> Result<(), RuntimeError> {
        if period.is_zero() {
            return Err(RuntimeError::invalid_config(format!(
                "timer \"{}\": period must be positive",
                entity.name
            )));
        }

        if self.shutdown.is_set() {
            return Err(RuntimeError::invalid_config(format!(
                "timer \"{}\": shutdown in progress",
                entity.name
            )));
        }

        if self.tasks.get(&entity.name).is_some_and(|task| !task.is_finished()) {
            return Err(RuntimeError::invalid_config(format!(
                "timer \"{}\" already scheduled",
                entity.name
            )));
        }

        info!(
            entity = %entity.name,
            module = %entity.linked.module().name(),
            period_ms = period.as_millis(),
            "scheduling timer"
        );

        let name = entity.name.clone();
        let span = info_span!("timer", vm = %entity.context.vm(), entity = %name);
        let task = tokio::spawn(entity.run(period, self.shutdown.clone()).instrument(span));

        self.tasks.insert(name, task);
        Ok(())
    }

    /// Abort `name`'s loop. Returns `false` if no loop was known.
    pub fn cancel_timer(&mut self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some(task) => {
                debug!(entity = name, "cancelling timer");
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Wait for `name`'s loop to end and take its entity back.
    ///
    /// Returns `None` for unknown or cancelled loops.
    pub async fn join(&mut self, name: &str) -> Option<TimerEntity> {
        let task = self.tasks.remove(name)?;
        task.await.ok()
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks.get(name).is_some_and(|task| !task.is_finished())
    }

    /// Number of loops still running.
    pub fn active(&self) -> usize {
        self.tasks.values().filter(|task| !task.is_finished()).count()
    }

    /// Raise the shutdown flag and wait for every loop to observe it.
    pub async fn shutdown(&mut self) -> Vec<TimerEntity> {
        self.shutdown.trigger();

        let mut entities = Vec::with_capacity(self.tasks.len());
        for (_, task) in self.tasks.drain() {
            if let Ok(entity) = task.await {
                entities.push(entity);
            }
        }
        entities
    }
}
