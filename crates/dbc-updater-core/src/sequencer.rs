//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Ordered update sequence with per-step abort policy."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dbc_common::config::UpdaterConfig;
use dbc_common::logging::{log_step_event, StepEventOutcome};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::error::{LockError, Result, UpdaterError};
use crate::lock::{UpdateCompletion, UpdateLock};
use crate::pincode::PinCodeGate;
use crate::power::{PowerController, PowerLevel};
use crate::readiness::ReadinessMonitor;
use crate::services::{ServiceController, ServiceManager};
use crate::shutdown::ShutdownSignal;
use crate::state::StateStore;

/// Whether a failing step stops the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepPolicy {
    Required,
    BestEffort,
}

impl StepPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPolicy::Required => "required",
            StepPolicy::BestEffort => "best-effort",
        }
    }
}

/// Value produced by a successful step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepOutput {
    Done,
    Update(UpdateCompletion),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum StepStatus {
    Completed { output: StepOutput },
    /// A best-effort step failed and the run went on.
    Warned { error: String },
    /// A required step failed; later steps were skipped.
    Aborted { error: String },
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: &'static str,
    pub policy: StepPolicy,
    #[serde(flatten)]
    pub status: StepStatus,
    pub elapsed_ms: u64,
}

/// Per-step transcript of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.aborted_at().is_none()
    }

    /// Name of the required step that aborted the run.
    pub fn aborted_at(&self) -> Option<&'static str> {
        self.steps
            .iter()
            .find(|step| matches!(step.status, StepStatus::Aborted { .. }))
            .map(|step| step.name)
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn warnings(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step.status, StepStatus::Warned { .. }))
            .count()
    }

    pub fn update_completion(&self) -> Option<UpdateCompletion> {
        self.steps.iter().find_map(|step| match step.status {
            StepStatus::Completed {
                output: StepOutput::Update(completion),
            } => Some(completion),
            _ => None,
        })
    }
}

pub type StepFuture<'a> = BoxFuture<'a, Result<StepOutput>>;

/// One entry of the step list: a name, a policy and the action to run.
pub struct Step<'a> {
    pub name: &'static str,
    pub policy: StepPolicy,
    action: Box<dyn FnOnce() -> StepFuture<'a> + Send + 'a>,
}

impl<'a> Step<'a> {
    pub fn new<F, Fut>(name: &'static str, policy: StepPolicy, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<StepOutput>> + Send + 'a,
    {
        Self {
            name,
            policy,
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn required<F, Fut>(name: &'static str, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<StepOutput>> + Send + 'a,
    {
        Self::new(name, StepPolicy::Required, action)
    }

    pub fn best_effort<F, Fut>(name: &'static str, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<StepOutput>> + Send + 'a,
    {
        Self::new(name, StepPolicy::BestEffort, action)
    }
}

/// Interpret a step list in order.
///
/// Best-effort failures are recorded as warnings. The first required failure
/// aborts the run: every later step is recorded as skipped and never runs.
/// Completed steps are not rolled back.
pub async fn drive(steps: Vec<Step<'_>>) -> RunReport {
    let mut report = RunReport {
        steps: Vec::with_capacity(steps.len()),
    };
    let mut aborted = false;

    for step in steps {
        let policy = step.policy.as_str();
        if aborted {
            log_step_event(step.name, policy, "skipped after abort", StepEventOutcome::Skipped);
            report.steps.push(StepRecord {
                name: step.name,
                policy: step.policy,
                status: StepStatus::Skipped,
                elapsed_ms: 0,
            });
            continue;
        }

        log_step_event(step.name, policy, "running", StepEventOutcome::Started);
        let started = Instant::now();
        let result = (step.action)().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let status = match (result, step.policy) {
            (Ok(output), _) => {
                log_step_event(step.name, policy, "done", StepEventOutcome::Success);
                StepStatus::Completed { output }
            }
            (Err(err), StepPolicy::BestEffort) => {
                let error = err.to_string();
                log_step_event(step.name, policy, &error, StepEventOutcome::Warning);
                StepStatus::Warned { error }
            }
            (Err(err), StepPolicy::Required) => {
                let error = err.to_string();
                log_step_event(step.name, policy, &error, StepEventOutcome::Fault);
                aborted = true;
                StepStatus::Aborted { error }
            }
        };
        report.steps.push(StepRecord {
            name: step.name,
            policy: step.policy,
            status,
            elapsed_ms,
        });
    }
    report
}

/// Owns the components of one update session and runs them in order.
pub struct UpdateSequencer {
    services: ServiceController,
    power: PowerController,
    pin_code: PinCodeGate,
    store: Arc<dyn StateStore>,
    lock: UpdateLock,
    shutdown: ShutdownSignal,
    signal_timeout: Duration,
    handoff_delay: Duration,
    update_timeout: Duration,
}

impl UpdateSequencer {
    pub fn new(
        config: &UpdaterConfig,
        services: Arc<dyn ServiceManager>,
        store: Arc<dyn StateStore>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            services: ServiceController::new(services, config.services.units.clone()),
            power: PowerController::from_config(&config.gpio),
            pin_code: PinCodeGate::new(store.clone(), config.signal_timeout),
            store,
            lock: UpdateLock::from_config(&config.lock),
            shutdown,
            signal_timeout: config.signal_timeout,
            handoff_delay: config.handoff_delay,
            update_timeout: config.update_timeout,
        }
    }

    /// The eleven steps of an update session, in execution order.
    pub fn steps(&self) -> Vec<Step<'_>> {
        vec![
            Step::required("stop-services", move || async move {
                self.services.stop().await.map(|_| StepOutput::Done)
            }),
            Step::best_effort("prepare-power", move || async move {
                self.power.prepare().await.map(|_| StepOutput::Done)
            }),
            Step::best_effort("power-on", move || async move {
                self.power.set_value(PowerLevel::On).map(|_| StepOutput::Done)
            }),
            Step::best_effort("monitor-ready", move || self.monitor_readiness()),
            Step::best_effort("set-pin-code", move || async move {
                self.pin_code.mark_update_window().await.map(|_| StepOutput::Done)
            }),
            Step::required("create-lock", move || async move {
                self.lock
                    .create()
                    .map(|_| StepOutput::Done)
                    .map_err(UpdaterError::from)
            }),
            Step::best_effort("run-update", move || self.hand_off()),
            Step::best_effort("await-update", move || self.await_update()),
            Step::best_effort("clear-pin-code", move || async move {
                self.pin_code.clear_update_window().await.map(|_| StepOutput::Done)
            }),
            Step::required("power-off", move || async move {
                self.power.set_value(PowerLevel::Off).map(|_| StepOutput::Done)
            }),
            Step::required("start-services", move || async move {
                self.services.start().await.map(|_| StepOutput::Done)
            }),
        ]
    }

    pub async fn run(&self) -> RunReport {
        info!(
            pin = self.power.pin(),
            lock = %self.lock.path().display(),
            update_timeout = ?self.update_timeout,
            "starting dbc update session"
        );
        drive(self.steps()).await
    }

    /// The monitor runs as its own task; the sequence waits for it to end.
    /// Its normal end (window elapsed or cancelled) is reported as a
    /// best-effort failure so it shows up in the transcript.
    async fn monitor_readiness(&self) -> Result<StepOutput> {
        let monitor =
            ReadinessMonitor::new(self.store.clone(), self.signal_timeout, self.shutdown.clone());
        let report = monitor.spawn().await??;
        Err(UpdaterError::ReadinessEnded {
            end: report.end,
            resets: report.resets,
        })
    }

    async fn hand_off(&self) -> Result<StepOutput> {
        if !self.lock.exists() {
            info!("update lock already removed; updater finished early");
            return Ok(StepOutput::Done);
        }
        info!(
            lock = %self.lock.path().display(),
            delay = ?self.handoff_delay,
            "handing off to external updater"
        );
        tokio::select! {
            _ = sleep(self.handoff_delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
        Ok(StepOutput::Done)
    }

    async fn await_update(&self) -> Result<StepOutput> {
        match self.lock.await_removal(self.update_timeout, &self.shutdown).await {
            Ok(()) => {
                info!("update completed");
                Ok(StepOutput::Update(UpdateCompletion::Removed))
            }
            Err(err @ (LockError::TimedOut { .. } | LockError::Cancelled { .. })) => {
                warn!(
                    error = %err,
                    created_at = ?self.lock.created_at(),
                    "update did not finish; removing lock and resuming normal operation"
                );
                self.lock.force_remove()?;
                Ok(StepOutput::Update(UpdateCompletion::ForceRemoved))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use parking_lot::Mutex;

    fn ok_step<'a>(name: &'static str, policy: StepPolicy, ran: &'a Mutex<Vec<&'static str>>) -> Step<'a> {
        Step::new(name, policy, move || async move {
            ran.lock().push(name);
            Ok::<_, UpdaterError>(StepOutput::Done)
        })
    }

    fn failing_step<'a>(name: &'static str, policy: StepPolicy, ran: &'a Mutex<Vec<&'static str>>) -> Step<'a> {
        Step::new(name, policy, move || async move {
            ran.lock().push(name);
            Err(UpdaterError::from(StateError::Unavailable("scripted".into())))
        })
    }

    #[tokio::test]
    async fn best_effort_failures_do_not_abort() {
        let ran = Mutex::new(Vec::new());
        let report = drive(vec![
            ok_step("a", StepPolicy::Required, &ran),
            failing_step("b", StepPolicy::BestEffort, &ran),
            ok_step("c", StepPolicy::Required, &ran),
        ])
        .await;
        assert!(report.is_success());
        assert_eq!(report.warnings(), 1);
        assert_eq!(*ran.lock(), vec!["a", "b", "c"]);
        assert!(matches!(
            report.step("b").map(|s| &s.status),
            Some(StepStatus::Warned { error }) if error.contains("scripted")
        ));
    }

    #[tokio::test]
    async fn required_failure_skips_everything_after_it() {
        let ran = Mutex::new(Vec::new());
        let report = drive(vec![
            ok_step("a", StepPolicy::BestEffort, &ran),
            failing_step("b", StepPolicy::Required, &ran),
            ok_step("c", StepPolicy::BestEffort, &ran),
            ok_step("d", StepPolicy::Required, &ran),
        ])
        .await;
        assert!(!report.is_success());
        assert_eq!(report.aborted_at(), Some("b"));
        assert_eq!(*ran.lock(), vec!["a", "b"]);
        assert_eq!(report.step("c").map(|s| &s.status), Some(&StepStatus::Skipped));
        assert_eq!(report.step("d").map(|s| &s.status), Some(&StepStatus::Skipped));
    }

    #[test]
    fn step_list_order_and_policies() {
        let sequencer = UpdateSequencer::new(
            &UpdaterConfig::default(),
            Arc::new(crate::services::ScriptedServiceManager::new()),
            Arc::new(crate::state::InMemoryStateStore::new()),
            ShutdownSignal::never(),
        );
        let plan: Vec<(&str, StepPolicy)> = sequencer
            .steps()
            .iter()
            .map(|step| (step.name, step.policy))
            .collect();
        use StepPolicy::{BestEffort, Required};
        assert_eq!(
            plan,
            vec![
                ("stop-services", Required),
                ("prepare-power", BestEffort),
                ("power-on", BestEffort),
                ("monitor-ready", BestEffort),
                ("set-pin-code", BestEffort),
                ("create-lock", Required),
                ("run-update", BestEffort),
                ("await-update", BestEffort),
                ("clear-pin-code", BestEffort),
                ("power-off", Required),
                ("start-services", Required),
            ]
        );
    }

    #[test]
    fn report_serializes_status_inline() {
        let report = RunReport {
            steps: vec![StepRecord {
                name: "await-update",
                policy: StepPolicy::BestEffort,
                status: StepStatus::Completed {
                    output: StepOutput::Update(UpdateCompletion::ForceRemoved),
                },
                elapsed_ms: 3000,
            }],
        };
        let value = serde_json::to_value(&report).expect("serializes");
        assert_eq!(value["steps"][0]["status"], "completed");
        assert_eq!(value["steps"][0]["policy"], "best-effort");
        assert_eq!(value["steps"][0]["output"]["update"], "force-removed");
        assert_eq!(report.update_completion(), Some(UpdateCompletion::ForceRemoved));
    }
}
