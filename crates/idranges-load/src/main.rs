#![doc = include_str!("../README.md")]

mod load;

use std::sync::Arc;

use clap::Parser;
use load::config::{CliArgs, LoadConfig};
use load::driver::run;
use load::telemetry::init_telemetry;
use portable_atomic::{AtomicBool, Ordering};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = LoadConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let interrupt = Arc::new(AtomicBool::new(false));
    tokio::spawn(interrupt_on_signal(Arc::clone(&interrupt)));

    let report = run(&config, interrupt).await;
    providers.shutdown();
    let report = report?;

    print!("{report}");
    if !report.is_consistent() {
        anyhow::bail!("shared backend state does not match the IDs that were issued");
    }
    Ok(())
}

fn log_startup_info(_config: &LoadConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting load run with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting load run with {} allocators over {} categories",
            _config.workers,
            _config.categories.len()
        );
    }
}

/// Raises `interrupt` on Ctrl+C or SIGTERM so workers stop taking IDs and the
/// run still returns every unused ID before verifying.
async fn interrupt_on_signal(interrupt: Arc<AtomicBool>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("failed to install SIGTERM handler: {_err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    interrupt.store(true, Ordering::Relaxed);
}
