//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Shared primitives for the updater crates."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
//! Shared primitives for the DBC updater workspace: the session
//! configuration model and the tracing setup used for the step transcript.

pub mod config;
pub mod logging;

pub use config::{
    parse_duration, GpioConfig, LockConfig, LoggingConfig, ServiceConfig, StateStoreConfig,
    UpdaterConfig,
};
pub use logging::{init_tracing, log_step_event, LogFormat, StepEventOutcome};
