mod cli;
mod emulator;
mod supervisor;
mod telemetry;

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::{
    cli::{Cli, Command},
    supervisor::{ServeConfig, Supervisor, control},
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(ServeConfig::try_from(args)?).await,
    }
}

async fn serve(config: ServeConfig) -> Result<()> {
    let _telemetry = telemetry::init(&config.telemetry)?;
    telemetry::init_metrics_recorder()?;

    let supervisor = Supervisor::new(config.settings, Handle::current());
    supervisor.initialize(config.simulation, config.video_params)?;
    supervisor.start();

    let control = control::spawn_control_server(config.control_addr, supervisor.clone())?;
    info!(addr = %control.local_addr(), "Detector supervisor running; press Ctrl+C to exit");

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {err}");
    }
    info!(launches = supervisor.launches(), "Shutting down");

    supervisor.stop().await;
    tokio::task::spawn_blocking(move || control.stop())
        .await
        .context("Control API thread panicked")?;
    Ok(())
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
