//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Bounded observation of dashboard readiness events."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{info, warn};

use crate::error::{Result, StateError};
use crate::shutdown::ShutdownSignal;
use crate::state::StateStore;

pub const DASHBOARD_CHANNEL: &str = "dashboard";
pub const DASHBOARD_KEY: &str = "dashboard";
pub const READY_FIELD: &str = "ready";
pub const READY_PAYLOAD: &str = "ready";

/// Why the observation loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessEnd {
    Elapsed,
    Cancelled,
}

impl fmt::Display for ReadinessEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessEnd::Elapsed => f.write_str("window elapsed"),
            ReadinessEnd::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessReport {
    /// Number of successful `dashboard.ready = "false"` writes.
    pub resets: u32,
    pub end: ReadinessEnd,
}

/// Watches the `dashboard` channel and resets `dashboard.ready` on every
/// `"ready"` event until the window elapses or cancellation is requested.
///
/// The loop does not stop after the first reset: the dashboard may announce
/// readiness more than once while it boots into the updater.
#[derive(Clone)]
pub struct ReadinessMonitor {
    store: Arc<dyn StateStore>,
    window: Duration,
    shutdown: ShutdownSignal,
}

impl ReadinessMonitor {
    pub fn new(store: Arc<dyn StateStore>, window: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            store,
            window,
            shutdown,
        }
    }

    /// Run [`Self::observe_readiness`] as its own task.
    pub fn spawn(self) -> JoinHandle<Result<ReadinessReport>> {
        tokio::spawn(async move { self.observe_readiness().await })
    }

    /// Observe readiness events for at most the configured window.
    ///
    /// Errors are limited to acquiring the subscription and to the channel
    /// closing underneath the loop. A window that elapses is a normal end.
    pub async fn observe_readiness(&self) -> Result<ReadinessReport> {
        let deadline = Instant::now() + self.window;
        let mut resets = 0u32;
        let report = |resets, end| ReadinessReport { resets, end };

        let subscribed = tokio::select! {
            result = timeout_at(deadline, async {
                let mut conn = self.store.connect().await?;
                let payloads = conn.subscribe(DASHBOARD_CHANNEL).await?;
                Ok::<_, StateError>((conn, payloads))
            }) => result,
            _ = self.shutdown.cancelled() => return Ok(report(0, ReadinessEnd::Cancelled)),
        };
        let (mut conn, mut payloads) = match subscribed {
            Ok(result) => result?,
            Err(_) => return Err(StateError::Timeout(self.window).into()),
        };
        info!(channel = DASHBOARD_CHANNEL, "subscribed to dashboard channel");

        let window = sleep_until(deadline);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => {
                    info!(resets, "readiness window elapsed");
                    return Ok(report(resets, ReadinessEnd::Elapsed));
                }
                _ = self.shutdown.cancelled() => {
                    info!(resets, "readiness monitoring cancelled");
                    return Ok(report(resets, ReadinessEnd::Cancelled));
                }
                next = payloads.next() => match next {
                    Some(Ok(payload)) => {
                        info!(payload = %payload, "dashboard event received");
                        if payload != READY_PAYLOAD {
                            continue;
                        }
                        match timeout_at(deadline, conn.hset(DASHBOARD_KEY, READY_FIELD, "false")).await {
                            Ok(Ok(())) => {
                                resets += 1;
                                info!(resets, "dashboard ready state reset to false");
                            }
                            Ok(Err(err)) => warn!(error = %err, "failed to reset dashboard ready state"),
                            Err(_) => {
                                warn!("readiness window elapsed during reset");
                                return Ok(report(resets, ReadinessEnd::Elapsed));
                            }
                        }
                    }
                    Some(Err(err)) => warn!(error = %err, "undecodable dashboard event"),
                    None => return Err(StateError::ChannelClosed.into()),
                },
            }
        }
    }
}
