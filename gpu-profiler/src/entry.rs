//! C entry points
//!
//! The host process (typically Python through `ctypes`) loads the cdylib and
//! calls these. Configuration comes from the environment; failures end the
//! process with a non-zero status.

use crate::config::{Config, LOG_FILTER_ENV};
use crate::cupti::{CuptiApi, DynamicCupti};
use crate::launch::LaunchInspector;
use crate::lifecycle::Profiler;
use crate::sink::{EventSink, FileDestination};
use crate::stack::ProcessStackCapturer;
use anyhow::{Context, Result};
use std::panic::catch_unwind;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static PROFILER: Mutex<Option<Profiler>> = Mutex::new(None);
static LAUNCH_INSPECTOR: Mutex<Option<LaunchInspector>> = Mutex::new(None);

/// Start the memory profiler for this process.
#[no_mangle]
pub extern "C" fn cuprof_memory_profiler_init() {
    guarded("cuprof_memory_profiler_init", || {
        init_tracing();
        if let Err(e) = start_memory_profiler() {
            exit_with(&e);
        }
    });
}

/// Flush and close the trace. Safe to call more than once.
#[no_mangle]
pub extern "C" fn cuprof_memory_profiler_shutdown() {
    guarded("cuprof_memory_profiler_shutdown", || {
        match lock(&PROFILER).as_ref() {
            Some(profiler) => {
                profiler.shutdown();
            }
            None => info!("Memory profiler was never started"),
        }
    });
}

/// Start printing kernel launch PDL usage to stdout.
#[no_mangle]
pub extern "C" fn cuprof_launch_inspector_init() {
    guarded("cuprof_launch_inspector_init", || {
        init_tracing();
        if let Err(e) = start_launch_inspector() {
            exit_with(&e);
        }
    });
}

#[no_mangle]
pub extern "C" fn cuprof_launch_inspector_shutdown() {
    guarded("cuprof_launch_inspector_shutdown", || {
        match lock(&LAUNCH_INSPECTOR).take() {
            Some(inspector) => inspector.shutdown(),
            None => info!("Launch inspector was never started"),
        }
    });
}

fn start_memory_profiler() -> Result<()> {
    let mut slot = lock(&PROFILER);
    if slot.is_some() {
        anyhow::bail!("memory profiler already initialized");
    }

    let config = Config::from_env().context("Failed to read profiler configuration")?;
    config.validate().context("Invalid profiler configuration")?;
    info!("Configuration: {:?}", config);

    let api: Arc<dyn CuptiApi> = Arc::new(
        DynamicCupti::load(&config.cupti_library).context("Failed to load CUPTI")?,
    );
    let sink = Arc::new(EventSink::new(Box::new(FileDestination::new(
        config.output_path.clone(),
    ))));
    let stacks = Arc::new(ProcessStackCapturer::new(config.capture_python));

    let profiler = Profiler::new(config, api, sink, stacks);
    profiler
        .try_init()
        .context("Failed to enable CUPTI tracing")?;
    *slot = Some(profiler);
    Ok(())
}

fn start_launch_inspector() -> Result<()> {
    let mut slot = lock(&LAUNCH_INSPECTOR);
    if slot.is_some() {
        anyhow::bail!("launch inspector already initialized");
    }

    let config = Config::from_env().context("Failed to read profiler configuration")?;
    let api: Arc<dyn CuptiApi> = Arc::new(
        DynamicCupti::load(&config.cupti_library).context("Failed to load CUPTI")?,
    );
    *slot = Some(LaunchInspector::init(api).context("Failed to subscribe launch inspector")?);
    Ok(())
}

/// Install the stderr subscriber unless the host already has one.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn exit_with(err: &anyhow::Error) -> ! {
    error!("fatal: {:#}", err);
    eprintln!("[cuprof] fatal: {:#}", err);
    std::process::exit(1)
}

/// Run an entry point body without letting a panic cross the C ABI.
fn guarded(entry: &str, body: impl FnOnce()) {
    if catch_unwind(std::panic::AssertUnwindSafe(body)).is_err() {
        error!("panic in {}", entry);
        eprintln!("[cuprof] panic in {}", entry);
        std::process::exit(1);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
