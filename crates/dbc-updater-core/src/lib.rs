//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Update orchestration for the dashboard computer."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
//! Orchestrates one dashboard computer (DBC) update session: stop the vehicle
//! services, power the DBC, open the update window in shared state, hand off
//! to the external updater through a lock file and restore normal operation.

pub mod error;
pub mod lock;
pub mod pincode;
pub mod power;
pub mod readiness;
pub mod sequencer;
pub mod services;
pub mod shutdown;
pub mod state;

pub use error::{LockError, Result, ServiceError, StateError, UpdaterError};
pub use lock::{UpdateCompletion, UpdateLock};
pub use pincode::PinCodeGate;
pub use power::{ExportState, PowerController, PowerLevel};
pub use readiness::{ReadinessEnd, ReadinessMonitor, ReadinessReport};
pub use sequencer::{
    drive, RunReport, Step, StepOutput, StepPolicy, StepRecord, StepStatus, UpdateSequencer,
};
pub use services::{ScriptedServiceManager, ServiceAction, ServiceController, ServiceManager, Systemctl};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use state::{InMemoryStateStore, RedisStore, StateConnection, StateStore};
