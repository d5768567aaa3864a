use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use clipforge::{ServiceConfig, VideoService};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "initialization failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config = ServiceConfig::from_env();
    tracing::info!(
        port = config.port,
        max_workers = config.max_workers,
        "starting clipforge"
    );

    let service = VideoService::start(config)?;
    install_signal_handlers();

    // The HTTP facade fronting this service runs out-of-process; the daemon
    // itself just keeps the workers alive until asked to stop.
    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutdown signal received");
    service.shutdown();
    Ok(())
}

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn handle_signal(_signal: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {
    // Non-unix builds rely on the process being stopped externally.
}
