//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Vehicle service stop/start through the host service manager."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError, UpdaterError};

/// Direction of a service manager call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Stop,
    Start,
}

impl ServiceAction {
    pub fn verb(&self) -> &'static str {
        match self {
            ServiceAction::Stop => "stop",
            ServiceAction::Start => "start",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Start/stop capability keyed by unit name.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn control(&self, action: ServiceAction, unit: &str) -> std::result::Result<(), ServiceError>;
}

/// `systemctl` backed service manager.
#[derive(Debug, Clone)]
pub struct Systemctl {
    program: PathBuf,
}

impl Systemctl {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn control(&self, action: ServiceAction, unit: &str) -> std::result::Result<(), ServiceError> {
        let output = Command::new(&self.program)
            .arg(action.verb())
            .arg(unit)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ServiceError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        if !output.stderr.is_empty() {
            debug!(
                unit,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "service manager diagnostics"
            );
        }
        classify_status(output.status)
    }
}

fn classify_status(status: ExitStatus) -> std::result::Result<(), ServiceError> {
    if status.success() {
        return Ok(());
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Err(ServiceError::ExitCode(code)),
        (None, Some(signal)) => Err(ServiceError::Signal(signal)),
        (None, None) => Err(ServiceError::ExitCode(-1)),
    }
}

/// Stops and starts the vehicle service set as one logical unit.
///
/// Every member gets its own call, regardless of earlier failures. The set
/// counts as stopped (or started) as soon as one member call succeeds, since
/// unit naming differs between deployed system versions.
#[derive(Clone)]
pub struct ServiceController {
    manager: Arc<dyn ServiceManager>,
    units: Vec<String>,
}

impl ServiceController {
    pub fn new(manager: Arc<dyn ServiceManager>, units: Vec<String>) -> Self {
        Self { manager, units }
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub async fn stop(&self) -> Result<()> {
        self.apply(ServiceAction::Stop).await
    }

    pub async fn start(&self) -> Result<()> {
        self.apply(ServiceAction::Start).await
    }

    async fn apply(&self, action: ServiceAction) -> Result<()> {
        let mut failures = Vec::new();
        let mut succeeded = 0usize;
        for unit in &self.units {
            match self.manager.control(action, unit).await {
                Ok(()) => {
                    info!(unit = %unit, action = %action, "service call succeeded");
                    succeeded += 1;
                }
                Err(err) => {
                    warn!(unit = %unit, action = %action, error = %err, "service call failed");
                    failures.push((unit.clone(), err));
                }
            }
        }
        if succeeded == 0 {
            return Err(UpdaterError::AllServicesFailed { action, failures });
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceController")
            .field("units", &self.units)
            .finish_non_exhaustive()
    }
}

/// In-memory service manager that records calls and fails configured units.
#[derive(Debug, Default)]
pub struct ScriptedServiceManager {
    failing: HashSet<String>,
    calls: Mutex<Vec<(ServiceAction, String)>>,
}

impl ScriptedServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for `unit` fail with exit code 5 (unit not loaded).
    pub fn failing(mut self, unit: impl Into<String>) -> Self {
        self.failing.insert(unit.into());
        self
    }

    pub fn calls(&self) -> Vec<(ServiceAction, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ServiceManager for ScriptedServiceManager {
    async fn control(&self, action: ServiceAction, unit: &str) -> std::result::Result<(), ServiceError> {
        self.calls.lock().push((action, unit.to_owned()));
        if self.failing.contains(unit) {
            return Err(ServiceError::ExitCode(5));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: &str = "librescoot-vehicle";
    const LEGACY: &str = "unu-vehicle";

    fn controller(manager: Arc<ScriptedServiceManager>) -> ServiceController {
        ServiceController::new(manager, vec![PRIMARY.to_owned(), LEGACY.to_owned()])
    }

    #[tokio::test]
    async fn one_successful_member_is_enough() {
        let manager = Arc::new(ScriptedServiceManager::new().failing(LEGACY));
        controller(manager.clone()).stop().await.expect("primary stopped");

        let manager = Arc::new(ScriptedServiceManager::new().failing(PRIMARY));
        controller(manager.clone()).start().await.expect("legacy started");
        assert_eq!(
            manager.calls(),
            vec![
                (ServiceAction::Start, PRIMARY.to_owned()),
                (ServiceAction::Start, LEGACY.to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn fails_only_when_every_member_fails() {
        let manager = Arc::new(ScriptedServiceManager::new().failing(PRIMARY).failing(LEGACY));
        let err = controller(manager.clone()).stop().await.expect_err("both failed");
        match err {
            UpdaterError::AllServicesFailed { action, failures } => {
                assert_eq!(action, ServiceAction::Stop);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.calls().len(), 2, "no short-circuit on first failure");
    }

    #[test]
    fn exit_status_is_classified_structurally() {
        assert!(classify_status(ExitStatus::from_raw(0)).is_ok());
        // Wait status encoding: exit code in the high byte, signal in the low bits.
        assert!(matches!(
            classify_status(ExitStatus::from_raw(5 << 8)),
            Err(ServiceError::ExitCode(5))
        ));
        assert!(matches!(
            classify_status(ExitStatus::from_raw(libc::SIGKILL)),
            Err(ServiceError::Signal(9))
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let manager = Systemctl::new("/nonexistent/systemctl");
        let err = manager
            .control(ServiceAction::Stop, PRIMARY)
            .await
            .expect_err("binary missing");
        match err {
            ServiceError::Spawn { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
