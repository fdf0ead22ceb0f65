//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "binary"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Binary entrypoint for the DBC updater."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dbc_common::config::{parse_duration, UpdaterConfig};
use dbc_common::logging::init_tracing;
use dbc_updater_core::services::Systemctl;
use dbc_updater_core::shutdown::{shutdown_channel, ShutdownTrigger};
use dbc_updater_core::state::RedisStore;
use dbc_updater_core::UpdateSequencer;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Power the dashboard computer, hand off to its updater and restore normal operation",
    long_about = None
)]
struct Cli {
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "30m",
        value_parser = parse_duration,
        help = "How long to wait for the external updater to remove the lock (e.g. 30m, 1h30m, 90)"
    )]
    update_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = UpdaterConfig::from_env()?.with_update_timeout(cli.update_timeout);
    config.validate()?;
    init_tracing("dbc-updater", &config.logging)?;
    info!(
        config = %serde_json::to_string(&config).context("serialising configuration")?,
        "configuration loaded"
    );

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(forward_signals(trigger));

    let store = RedisStore::open(&config.state_store.url)
        .with_context(|| format!("invalid state store url {}", config.state_store.url))?;
    let services = Systemctl::new(config.services.systemctl.clone());
    let sequencer = UpdateSequencer::new(&config, Arc::new(services), Arc::new(store), shutdown);

    let report = sequencer.run().await;
    info!(
        report = %serde_json::to_string(&report).context("serialising run report")?,
        "update session finished"
    );

    match report.aborted_at() {
        None => {
            info!(
                warnings = report.warnings(),
                completion = ?report.update_completion(),
                "dbc update session completed"
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(step) => {
            error!(step, "dbc update session aborted");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// The first SIGINT or SIGTERM cancels the bounded waits so the restore
/// steps still run. A second SIGINT exits immediately.
async fn forward_signals(trigger: ShutdownTrigger) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received; cancelling pending waits");
        }
        _ = terminate.recv() => info!("SIGTERM received; cancelling pending waits"),
    }
    trigger.trigger();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("second ctrl-c received; exiting without restoring state");
        std::process::exit(130);
    }
}
