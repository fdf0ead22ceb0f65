//! ---
//! dbc_section: "03-logging"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Tracing setup and step transcript events."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "DBC_UPDATER_LOG";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Console output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Initialize the tracing subscriber.
///
/// * `DBC_UPDATER_LOG` overrides the filter directive, then `RUST_LOG` is
///   honoured, finally defaulting to `info`.
/// * The console layer writes to stdout since the step transcript is the
///   operator-facing output. A daily rolling JSON file is added when
///   `config.directory` is set.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to info logging",
                LOG_ENV, err
            );
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let console_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = daily(directory, format!("{}.log", service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, format = ?config.format, log_dir = ?config.directory, "tracing initialised");
    Ok(())
}

/// Outcome attached to a step transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEventOutcome {
    /// The step is about to run.
    Started,
    /// The step completed.
    Success,
    /// A best-effort step failed; the run continues.
    Warning,
    /// A required step failed; the run stops here.
    Fault,
    /// The step was not run because an earlier required step failed.
    Skipped,
}

impl StepEventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepEventOutcome::Started => "started",
            StepEventOutcome::Success => "success",
            StepEventOutcome::Warning => "warning",
            StepEventOutcome::Fault => "fault",
            StepEventOutcome::Skipped => "skipped",
        }
    }

    fn level(&self) -> Level {
        match self {
            StepEventOutcome::Started | StepEventOutcome::Success => Level::INFO,
            StepEventOutcome::Warning | StepEventOutcome::Skipped => Level::WARN,
            StepEventOutcome::Fault => Level::ERROR,
        }
    }
}

/// Emit one line of the step transcript.
pub fn log_step_event(step: &str, policy: &str, message: &str, outcome: StepEventOutcome) {
    // `tracing::event!` needs a constant level, so dispatch per level.
    macro_rules! emit {
        ($level:expr) => {
            tracing::event!(
                $level,
                step,
                policy,
                outcome = outcome.as_str(),
                message = %message
            )
        };
    }
    match outcome.level() {
        Level::ERROR => emit!(Level::ERROR),
        Level::WARN => emit!(Level::WARN),
        _ => emit!(Level::INFO),
    }
}
