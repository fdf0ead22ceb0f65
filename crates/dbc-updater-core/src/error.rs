//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Error taxonomy for sequence steps."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::readiness::ReadinessEnd;
use crate::services::ServiceAction;

/// Shared result type for sequencer operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Failure of a single service manager invocation.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service manager binary could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    /// The service manager ran and reported failure.
    #[error("exited with status code {0}")]
    ExitCode(i32),
    /// The service manager was killed before reporting.
    #[error("terminated by signal {0}")]
    Signal(i32),
}

/// Failure talking to the shared state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("state store operation exceeded {0:?}")]
    Timeout(Duration),
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Failure around the update lock file.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to write lock {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove lock {}: {source}", .path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("lock {} still present after {waited:?}", .path.display())]
    TimedOut { path: PathBuf, waited: Duration },
    #[error("wait for lock {} cancelled", .path.display())]
    Cancelled { path: PathBuf },
}

/// Failure of one sequence step.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("could not {action} any vehicle service: {}", FailureList(.failures))]
    AllServicesFailed {
        action: ServiceAction,
        failures: Vec<(String, ServiceError)>,
    },
    #[error("gpio {pin}: failed to write {attribute} ({}): {source}", .path.display())]
    Gpio {
        pin: u32,
        attribute: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("readiness monitoring {end} after {resets} reset(s)")]
    ReadinessEnded { end: ReadinessEnd, resets: u32 },
    #[error("readiness monitor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct FailureList<'a>(&'a [(String, ServiceError)]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (unit, err)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{unit} ({err})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_failures_are_listed_per_unit() {
        let err = UpdaterError::AllServicesFailed {
            action: ServiceAction::Stop,
            failures: vec![
                ("librescoot-vehicle".into(), ServiceError::ExitCode(5)),
                ("unu-vehicle".into(), ServiceError::Signal(9)),
            ],
        };
        assert_eq!(
            err.to_string(),
            "could not stop any vehicle service: librescoot-vehicle (exited with status code 5), \
             unu-vehicle (terminated by signal 9)"
        );
    }

    #[test]
    fn gpio_error_keeps_io_source() {
        let err = UpdaterError::Gpio {
            pin: 50,
            attribute: "value",
            path: PathBuf::from("/sys/class/gpio/gpio50/value"),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        let source = std::error::Error::source(&err).expect("io source preserved");
        assert!(source.downcast_ref::<io::Error>().is_some());
        assert!(err.to_string().starts_with("gpio 50: failed to write value"));
    }
}
