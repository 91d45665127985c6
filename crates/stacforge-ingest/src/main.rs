//! stacforge - resumable, partitioned catalog ingestion

use clap::Parser;
use stacforge_common::logging::{init_logging, LogConfig, LogLevel};
use stacforge_ingest::Cli;
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("stacforge")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        },
    };

    let cancel = CancellationToken::new();
    tokio::spawn(watch_interrupts(cancel.clone()));

    let result = cli.execute(cancel).await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        drop(guard);
        process::exit(1);
    }
}

/// First interrupt finishes the in-flight batch and stops; the second exits at once
async fn watch_interrupts(cancel: CancellationToken) {
    if wait_for_interrupt().await.is_err() {
        error!("Failed to install signal handlers");
        return;
    }
    warn!("Interrupt received, stopping after the current batch (press Ctrl+C again to abort)");
    cancel.cancel();

    if wait_for_interrupt().await.is_ok() {
        error!("Second interrupt received, aborting");
        process::exit(1);
    }
}

#[cfg(unix)]
async fn wait_for_interrupt() -> std::io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> std::io::Result<()> {
    signal::ctrl_c().await
}
