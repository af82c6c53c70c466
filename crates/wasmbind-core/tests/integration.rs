//! Integration tests for wasmbind-core.
//!
//! These tests drive the whole pipeline through the public API:
//! - Registration and compilation of WAT modules
//! - Linking against host interfaces
//! - Per-context instance creation, reuse and isolation
//! - Host function trampolines and guest memory access
//! - Timer resumption loops

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};
use wasmtime::{Val, ValType};

use wasmbind_common::{EngineConfig, ExecutionConfig, RuntimeConfig, RuntimeError};
use wasmbind_core::{
    HostFunction, HostInterface, LinkedModule, LogLevel, ModuleSource, Runtime, TimerEntity,
    TimerScheduler, TimerState, TimerStop,
};

// ============================================================================
// Helpers
// ============================================================================

fn config() -> RuntimeConfig {
    RuntimeConfig {
        name: "test".into(),
        engine: EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        },
        execution: ExecutionConfig::default(),
    }
}

fn runtime(modules: &[(&str, &str)], hosts: Vec<HostInterface>) -> Runtime {
    runtime_with(config(), modules, hosts)
}

fn runtime_with(
    config: RuntimeConfig,
    modules: &[(&str, &str)],
    hosts: Vec<HostInterface>,
) -> Runtime {
    let mut rt = Runtime::new(&config).unwrap();

    rt.register_host_interface(HostInterface::new("empty")).unwrap();
    for host in hosts {
        rt.register_host_interface(host).unwrap();
    }

    for (name, wat) in modules {
        rt.register_module(name, ModuleSource::Wat((*wat).to_string()))
            .unwrap();
    }

    rt.initialize().unwrap();
    rt
}

fn i32_of(vals: &[Val]) -> i32 {
    assert_eq!(vals.len(), 1);
    vals[0].unwrap_i32()
}

/// `env.echo(ptr, len)`: logs the bytes found in the caller's memory.
fn echo() -> HostFunction {
    HostFunction::new(
        "echo",
        [ValType::I32, ValType::I32],
        [],
        |call, params, _| {
            let bytes = call.read_memory(params[0].unwrap_i32(), params[1].unwrap_i32())?;
            let module = call.module_name().to_string();
            let message = String::from_utf8_lossy(&bytes).into_owned();
            call.data_mut().log(LogLevel::Info, &module, message);
            Ok(())
        },
    )
}

const DOUBLE: &str = r#"
    (module
        (func (export "double") (param i32) (result i32)
            (i32.mul (local.get 0) (i32.const 2)))
    )
"#;

const COUNTER: &str = r#"
    (module
        (global $n (mut i32) (i32.const 0))
        (func (export "incr") (result i32)
            (global.set $n (i32.add (global.get $n) (i32.const 1)))
            (global.get $n))
    )
"#;

const FAULTY: &str = r#"
    (module
        (func (export "boom") unreachable)
        (func (export "ok") (result i32) (i32.const 1))
    )
"#;

// ============================================================================
// Test: End-to-End
// ============================================================================

#[test]
fn test_double_across_contexts() {
    let rt = runtime(&[("m", DOUBLE)], vec![]);
    let linked = rt.link("m", "empty").unwrap();

    let mut first = rt.new_context().unwrap();
    let results = first.call(&linked, "double", &[Val::I32(21)]).unwrap();
    assert_eq!(i32_of(&results), 42);

    let data = first.destroy();
    assert_eq!(data.metrics.calls, 1);
    assert!(data.metrics.duration.is_some());

    let mut second = rt.new_context().unwrap();
    let results = second.call(&linked, "double", &[Val::I32(21)]).unwrap();
    assert_eq!(i32_of(&results), 42);
}

// ============================================================================
// Test: Instance Reuse
// ============================================================================

#[test]
fn test_instance_reuse_within_context() {
    let rt = runtime(&[("counter", COUNTER)], vec![]);
    let linked = rt.link("counter", "empty").unwrap();

    let mut ctx = rt.new_context().unwrap();
    let first = ctx.get_or_create_instance(&linked).unwrap().instance().id();
    let second = ctx.get_or_create_instance(&linked).unwrap().instance().id();

    assert_eq!(first, second);
    assert_eq!(ctx.instance_count(), 1);
    assert_eq!(ctx.data().metrics.instances, 1);

    // Guest state lives as long as the instance
    assert_eq!(i32_of(&ctx.call(&linked, "incr", &[]).unwrap()), 1);
    assert_eq!(i32_of(&ctx.call(&linked, "incr", &[]).unwrap()), 2);

    let mut other = rt.new_context().unwrap();
    let third = other.get_or_create_instance(&linked).unwrap().instance().id();
    assert_ne!(first, third);
    assert_eq!(i32_of(&other.call(&linked, "incr", &[]).unwrap()), 1);
}

#[test]
fn test_two_links_get_two_instances() {
    let rt = runtime(&[("counter", COUNTER)], vec![]);
    let a = rt.link("counter", "empty").unwrap();
    let b = rt.link("counter", "empty").unwrap();
    assert_ne!(a.index(), b.index());

    let mut ctx = rt.new_context().unwrap();
    assert_eq!(i32_of(&ctx.call(&a, "incr", &[]).unwrap()), 1);
    assert_eq!(i32_of(&ctx.call(&a, "incr", &[]).unwrap()), 2);
    assert_eq!(i32_of(&ctx.call(&b, "incr", &[]).unwrap()), 1);
    assert_eq!(ctx.instance_count(), 2);
}

#[test]
fn test_context_grows_for_later_links() {
    let rt = runtime(&[("m", DOUBLE)], vec![]);
    let mut ctx = rt.new_context().unwrap();

    // Linked after the context was created
    let linked = rt.link("m", "empty").unwrap();
    let results = ctx.call(&linked, "double", &[Val::I32(4)]).unwrap();
    assert_eq!(i32_of(&results), 8);
}

// ============================================================================
// Test: Errors and Isolation
// ============================================================================

#[test]
fn test_trap_isolation() {
    let rt = runtime(&[("faulty", FAULTY), ("m", DOUBLE)], vec![]);
    let faulty = rt.link("faulty", "empty").unwrap();
    let double = rt.link("m", "empty").unwrap();

    let mut ctx = rt.new_context().unwrap();

    let err = ctx.call(&faulty, "boom", &[]).unwrap_err();
    assert!(err.is_trap());
    assert!(matches!(&err, RuntimeError::Trap { code: Some(code), .. } if code == "UnreachableCodeReached"));

    let results = ctx.call(&double, "double", &[Val::I32(5)]).unwrap();
    assert_eq!(i32_of(&results), 10);

    // The trapped instance itself is still there
    assert_eq!(i32_of(&ctx.call(&faulty, "ok", &[]).unwrap()), 1);
    assert_eq!(ctx.instance_count(), 2);
    assert_eq!(ctx.data().metrics.traps, 1);
}

#[test]
fn test_call_errors() {
    let rt = runtime(&[("m", DOUBLE)], vec![]);
    let linked = rt.link("m", "empty").unwrap();
    let mut ctx = rt.new_context().unwrap();

    let err = ctx.call(&linked, "nope", &[]).unwrap_err();
    assert!(err.is_not_found());

    let err = ctx.call(&linked, "double", &[]).unwrap_err();
    assert!(matches!(err, RuntimeError::ArityMismatch { what: "params", .. }));

    let mut instance = ctx.get_or_create_instance(&linked).unwrap();
    let err = instance.call("double", &[Val::I32(1)], 2).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ArityMismatch {
            what: "results",
            expected: 2,
            found: 1,
            ..
        }
    ));
}

#[test]
fn test_exported_func_handle() {
    let rt = runtime(&[("m", DOUBLE)], vec![]);
    let linked = rt.link("m", "empty").unwrap();
    let func = linked.module().func_lookup("double").unwrap().clone();

    let mut ctx = rt.new_context().unwrap();
    let mut instance = ctx.get_or_create_instance(&linked).unwrap();
    let results = instance.call_func(&func, &[Val::I32(7)], 1).unwrap();
    assert_eq!(i32_of(&results), 14);
}

#[test]
#[should_panic(expected = "called on an instance of")]
fn test_exported_func_from_other_module_panics() {
    let rt = runtime(&[("m", DOUBLE), ("counter", COUNTER)], vec![]);
    let double = rt.link("m", "empty").unwrap();
    let counter = rt.link("counter", "empty").unwrap();
    let func = double.module().func_lookup("double").unwrap().clone();

    let mut ctx = rt.new_context().unwrap();
    let mut instance = ctx.get_or_create_instance(&counter).unwrap();
    let _ = instance.call_func(&func, &[Val::I32(7)], 1);
}

#[test]
fn test_fuel_exhaustion_is_per_call() {
    let config = RuntimeConfig {
        execution: ExecutionConfig {
            max_fuel: 10_000,
            fuel_metering: true,
            ..Default::default()
        },
        ..config()
    };
    let wat = r#"
        (module
            (func (export "spin") (loop $l (br $l)))
            (func (export "ok") (result i32) (i32.const 1))
        )
    "#;
    let rt = runtime_with(config, &[("spin", wat)], vec![]);
    let linked = rt.link("spin", "empty").unwrap();
    let mut ctx = rt.new_context().unwrap();

    let err = ctx.call(&linked, "spin", &[]).unwrap_err();
    assert!(err.is_resource_limit());

    assert_eq!(i32_of(&ctx.call(&linked, "ok", &[]).unwrap()), 1);
    assert!(ctx.data().metrics.fuel_consumed >= 10_000);
}

// ============================================================================
// Test: Linking
// ============================================================================

const NEEDS_XY: &str = r#"
    (module
        (import "env" "x" (func))
        (import "env" "y" (func))
        (func (export "run") (call 0) (call 1))
    )
"#;

fn noop(name: &str) -> HostFunction {
    HostFunction::new(name, [], [], |_, _, _| Ok(()))
}

#[test]
fn test_link_missing_import() {
    let partial = HostInterface::new("partial").with(noop("x"));
    let full = HostInterface::new("full").with(noop("x")).with(noop("y"));
    let rt = runtime(&[("m", NEEDS_XY)], vec![partial, full]);

    let err = assert_err!(rt.link("m", "partial"));
    assert!(matches!(&err, RuntimeError::MissingImport { name, .. } if name == "y"));
    assert!(rt.linked_modules().is_empty());

    let linked = assert_ok!(rt.link("m", "full"));
    assert_eq!(linked.index(), 0);

    let mut ctx = rt.new_context().unwrap();
    assert_ok!(ctx.call(&linked, "run", &[]));
}

#[test]
fn test_instantiation_failure_keeps_context_usable() {
    let start_trap = r#"
        (module
            (func $start unreachable)
            (start $start)
        )
    "#;
    let rt = runtime(&[("bad", start_trap), ("m", DOUBLE)], vec![]);
    let bad = rt.link("bad", "empty").unwrap();
    let good = rt.link("m", "empty").unwrap();

    let mut ctx = rt.new_context().unwrap();

    let err = ctx.get_or_create_instance(&bad).unwrap_err();
    assert!(matches!(err, RuntimeError::InstantiationFailed { .. }));
    assert_eq!(ctx.instance_count(), 0);
    assert!(ctx.instance(&bad).is_none());

    let results = ctx.call(&good, "double", &[Val::I32(1)]).unwrap();
    assert_eq!(i32_of(&results), 2);

    assert!(ctx.get_or_create_instance(&bad).is_err());
    assert_eq!(ctx.instance_count(), 1);
}

#[test]
fn test_signature_mismatch_rejected_at_instantiation() {
    let wrong = HostInterface::new("wrong").with(HostFunction::new(
        "x",
        [ValType::I64],
        [],
        |_, _, _| Ok(()),
    ))
    .with(noop("y"));
    let rt = runtime(&[("m", NEEDS_XY)], vec![wrong]);
    let linked = rt.link("m", "wrong").unwrap();

    let mut ctx = rt.new_context().unwrap();
    let err = ctx.get_or_create_instance(&linked).unwrap_err();
    assert!(matches!(err, RuntimeError::InstantiationFailed { .. }));
}

// ============================================================================
// Test: Trampolines
// ============================================================================

fn echo_module(text: &str) -> String {
    format!(
        r#"
        (module
            (import "env" "echo" (func $echo (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "{text}")
            (func (export "run") (call $echo (i32.const 16) (i32.const {len})))
        )
        "#,
        len = text.len()
    )
}

#[test]
fn test_host_function_sees_calling_instance() {
    let alpha = echo_module("alpha");
    let beta = echo_module("beta");
    let host = HostInterface::new("echo").with(echo());
    let rt = runtime(&[("a", alpha.as_str()), ("b", beta.as_str())], vec![host]);

    let a = rt.link("a", "echo").unwrap();
    let b = rt.link("b", "echo").unwrap();

    let mut ctx = rt.new_context().unwrap();
    ctx.call(&a, "run", &[]).unwrap();
    ctx.call(&b, "run", &[]).unwrap();
    ctx.call(&a, "run", &[]).unwrap();

    let logs: Vec<_> = ctx
        .data()
        .logs
        .iter()
        .map(|entry| (entry.module.as_str(), entry.message.as_str()))
        .collect();
    assert_eq!(logs, [("a", "alpha"), ("b", "beta"), ("a", "alpha")]);

    let imported: Vec<_> = ctx.instance(&a).unwrap().host_functions().collect();
    assert_eq!(imported, ["echo"]);
}

#[test]
fn test_host_function_during_start() {
    let wat = r#"
        (module
            (import "env" "echo" (func $echo (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "hi")
            (func $start (call $echo (i32.const 0) (i32.const 2)))
            (start $start)
        )
    "#;
    let host = HostInterface::new("echo").with(echo());
    let rt = runtime(&[("m", wat)], vec![host]);
    let linked = rt.link("m", "echo").unwrap();

    let mut ctx = rt.new_context().unwrap();
    assert_ok!(ctx.get_or_create_instance(&linked));
    assert_eq!(ctx.data().logs[0].message, "hi");
}

#[test]
fn test_host_function_error_traps() {
    let wat = r#"
        (module
            (import "env" "echo" (func $echo (param i32 i32)))
            (memory (export "memory") 1)
            (func (export "run") (call $echo (i32.const 65530) (i32.const 100)))
        )
    "#;
    let host = HostInterface::new("echo").with(echo());
    let rt = runtime(&[("m", wat)], vec![host]);
    let linked = rt.link("m", "echo").unwrap();

    let mut ctx = rt.new_context().unwrap();
    let err = ctx.call(&linked, "run", &[]).unwrap_err();
    assert!(err.is_trap());
    assert!(err.to_string().contains("out of bounds"), "{err}");
}

#[test]
fn test_instance_memory_access() {
    let wat = r#"
        (module
            (memory (export "memory") 1)
            (func (export "sum") (param i32 i32) (result i32)
                (local $acc i32)
                (block $done
                    (loop $next
                        (br_if $done (i32.eqz (local.get 1)))
                        (local.set $acc
                            (i32.add (local.get $acc) (i32.load8_u (local.get 0))))
                        (local.set 0 (i32.add (local.get 0) (i32.const 1)))
                        (local.set 1 (i32.sub (local.get 1) (i32.const 1)))
                        (br $next)))
                (local.get $acc))
        )
    "#;
    let rt = runtime(&[("m", wat)], vec![]);
    let linked = rt.link("m", "empty").unwrap();

    let mut ctx = rt.new_context().unwrap();
    let mut instance = ctx.get_or_create_instance(&linked).unwrap();
    assert!(instance.instance().memory().is_some());

    instance.memory_write(100, &[1, 2, 3, 4]).unwrap();
    assert_eq!(instance.memory_read(100, 4).unwrap(), [1, 2, 3, 4]);

    let results = instance.call("sum", &[Val::I32(100), Val::I32(4)], 1).unwrap();
    assert_eq!(i32_of(&results), 10);

    assert!(instance.memory_read(65_535, 2).is_err());
}

// ============================================================================
// Test: Timers
// ============================================================================

const TICKER: &str = r#"
    (module
        (global $n (mut i32) (i32.const 0))
        (func (export "on_timer")
            (global.set $n (i32.add (global.get $n) (i32.const 1)))
            (if (i32.ge_s (global.get $n) (i32.const 3))
                (then unreachable)))
        (func (export "count") (result i32) (global.get $n))
    )
"#;

fn timer_entity(rt: &Runtime, module: &str, callback: &str) -> (TimerEntity, Arc<LinkedModule>) {
    let linked = rt.link(module, "empty").unwrap();
    let context = rt.new_context().unwrap();
    let entity = TimerEntity::new("root", context, Arc::clone(&linked), callback);
    (entity, linked)
}

#[tokio::test(start_paused = true)]
async fn test_timer_stops_after_failed_firing() {
    let rt = runtime(&[("ticker", TICKER)], vec![]);
    let (entity, linked) = timer_entity(&rt, "ticker", "on_timer");
    let mut scheduler = TimerScheduler::new(rt.shutdown_flag());

    scheduler
        .schedule_timer(entity, Duration::from_millis(10))
        .unwrap();
    assert!(scheduler.is_scheduled("root"));

    let mut entity = scheduler.join("root").await.unwrap();

    assert_eq!(entity.firings(), 3);
    assert_eq!(entity.state(), TimerState::Idle);
    assert!(matches!(entity.stop_reason(), Some(TimerStop::Failed(e)) if e.is_trap()));
    assert_eq!(scheduler.active(), 0);

    // The third firing trapped after the increment, and nothing fired since
    let count = entity.context_mut().call(&linked, "count", &[]).unwrap();
    assert_eq!(i32_of(&count), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timer_without_callback_never_fires() {
    let rt = runtime(&[("m", DOUBLE)], vec![]);
    let (entity, _) = timer_entity(&rt, "m", "on_timer");
    let mut scheduler = TimerScheduler::new(rt.shutdown_flag());

    scheduler
        .schedule_timer(entity, Duration::from_millis(10))
        .unwrap();
    let entity = scheduler.join("root").await.unwrap();

    assert_eq!(entity.firings(), 0);
    assert!(matches!(entity.stop_reason(), Some(TimerStop::NoCallback)));
    assert_eq!(entity.into_context().instance_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timer_stops_on_shutdown() {
    let mut rt = runtime(&[("counter", COUNTER)], vec![]);
    let (entity, _) = timer_entity(&rt, "counter", "incr");
    let mut scheduler = TimerScheduler::new(rt.shutdown_flag());

    scheduler
        .schedule_timer(entity, Duration::from_millis(10))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(35)).await;
    rt.shutdown();

    let entities = scheduler.shutdown().await;
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].firings(), 3);
    assert!(matches!(entities[0].stop_reason(), Some(TimerStop::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_timer_scheduling_rules() {
    let rt = runtime(&[("counter", COUNTER)], vec![]);
    let mut scheduler = TimerScheduler::new(rt.shutdown_flag());

    let (entity, _) = timer_entity(&rt, "counter", "incr");
    assert!(scheduler.schedule_timer(entity, Duration::ZERO).is_err());

    let (entity, _) = timer_entity(&rt, "counter", "incr");
    scheduler
        .schedule_timer(entity, Duration::from_millis(10))
        .unwrap();

    let (duplicate, _) = timer_entity(&rt, "counter", "incr");
    let err = scheduler
        .schedule_timer(duplicate, Duration::from_millis(10))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidConfig { .. }));

    assert!(scheduler.cancel_timer("root"));
    assert!(!scheduler.cancel_timer("root"));
    assert!(scheduler.join("root").await.is_none());
}
