//! wasmbind CLI entry point.
//!
//! Loads a configuration file, registers and compiles its modules, then
//! optionally invokes one export and drives the configured timers until
//! Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wasmtime::Val;

use wasmbind_common::{ConfigFile, ModuleEntry};
use wasmbind_core::{ModuleSource, Runtime, TimerEntity, TimerScheduler};

#[derive(Parser)]
#[command(name = "wasmbind", about = "Host WebAssembly modules against native interfaces")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "WASMBIND_CONFIG")]
    config: Option<PathBuf>,

    /// Export to call once in a fresh execution context, as <module>:<export>
    #[arg(long)]
    invoke: Option<String>,

    /// Host interface the invoked module is linked with
    #[arg(long, default_value = "pairs")]
    host: String,

    /// i32 arguments passed to --invoke
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<i32>,

    /// Exit after --invoke instead of running timers
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wasmbind=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigFile::default(),
    };
    config.validate().context("Invalid configuration")?;

    let mut runtime = Runtime::new(&config.runtime)?;
    wasmbind_host::register_all(&mut runtime)?;

    register_modules(&mut runtime, &config.modules)?;

    runtime
        .initialize()
        .with_context(|| format!("Failed to initialize \"{}\" wasm VM", runtime.name()))?;

    let ticker = runtime.engine().config().epoch_interruption.then(|| {
        let engine = runtime.engine().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1));
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        })
    });

    if let Some(target) = &cli.invoke {
        invoke(&runtime, target, &cli.host, &cli.args)?;
    }

    if !cli.once {
        let mut scheduler = TimerScheduler::new(runtime.shutdown_flag());

        for entry in &config.timers {
            let linked = runtime.link(&entry.module, &entry.host)?;
            let context = runtime.new_context()?;
            let period = entry
                .period_ms
                .map_or_else(|| runtime.config().execution.timer_period(), Duration::from_millis);

            let entity = TimerEntity::new(&entry.entity, context, linked, &entry.callback);
            scheduler.schedule_timer(entity, period)?;
        }

        info!(timers = scheduler.active(), "wasmbind running, press Ctrl-C to stop");

        shutdown_signal().await;

        runtime.shutdown();
        for entity in scheduler.shutdown().await {
            info!(entity = %entity.name(), firings = entity.firings(), "timer stopped");
            entity.into_context().destroy();
        }
    }

    if let Some(ticker) = ticker {
        ticker.abort();
    }

    runtime.shutdown();
    info!("wasmbind stopped");

    Ok(())
}

/// Register every configured module for the next `initialize`.
fn register_modules(runtime: &mut Runtime, modules: &[ModuleEntry]) -> anyhow::Result<()> {
    for entry in modules {
        runtime
            .register_module(&entry.name, ModuleSource::Path(entry.path.clone()))
            .with_context(|| format!("Failed to register module \"{}\"", entry.name))?;
    }
    Ok(())
}

/// Call `<module>:<export>` in a context of its own.
fn invoke(runtime: &Runtime, target: &str, host: &str, args: &[i32]) -> anyhow::Result<()> {
    let (module, export) = target
        .split_once(':')
        .with_context(|| format!("Invalid --invoke target \"{target}\", expected <module>:<export>"))?;

    let linked = runtime.link(module, host)?;
    let mut context = runtime.new_context()?;

    let args: Vec<Val> = args.iter().copied().map(Val::I32).collect();
    let result = context.call(&linked, export, &args);

    let data = context.destroy();
    for entry in &data.logs {
        info!(module = %entry.module, level = %entry.level, "guest: {}", entry.message);
    }

    let results = result.with_context(|| format!("Failed calling \"{target}\""))?;
    info!(
        results = ?results,
        fuel_consumed = data.metrics.fuel_consumed,
        "invoked \"{target}\""
    );

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
