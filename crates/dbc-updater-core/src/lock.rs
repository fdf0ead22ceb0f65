//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Lock-file rendez-vous with the external updater."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dbc_common::config::LockConfig;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::error::LockError;
use crate::shutdown::ShutdownSignal;

type LockResult<T> = std::result::Result<T, LockError>;

/// How the update window was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateCompletion {
    /// The external updater deleted the lock.
    Removed,
    /// The wait ended without removal and the lock was deleted here.
    ForceRemoved,
}

/// Marker file whose existence means "update in progress".
#[derive(Debug, Clone)]
pub struct UpdateLock {
    path: PathBuf,
    poll_interval: Duration,
}

impl UpdateLock {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.path.clone(), config.poll_interval)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the lock with the current Unix timestamp, replacing a stale one.
    pub fn create(&self) -> LockResult<()> {
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&self.path)?;
            write!(file, "{}", Utc::now().timestamp())?;
            file.sync_all()
        };
        write().map_err(|source| LockError::Create {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "update lock created");
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Creation time recorded in the lock, if it is present and readable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let secs = raw.trim().parse::<i64>().ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    /// Wait until the lock is gone, polling every `poll_interval`.
    ///
    /// Returns immediately when the lock is already absent. Only a `NotFound`
    /// stat result counts as removal.
    pub async fn await_removal(&self, limit: Duration, shutdown: &ShutdownSignal) -> LockResult<()> {
        let poll = async {
            loop {
                match fs::metadata(&self.path) {
                    Err(err) if err.kind() == io::ErrorKind::NotFound => return,
                    Err(err) => debug!(path = %self.path.display(), error = %err, "lock stat failed; polling again"),
                    Ok(_) => {}
                }
                sleep(self.poll_interval).await;
            }
        };
        tokio::select! {
            biased;
            waited = timeout(limit, poll) => {
                waited.map_err(|_| LockError::TimedOut {
                    path: self.path.clone(),
                    waited: limit,
                })?;
                info!(path = %self.path.display(), "update lock removed");
                Ok(())
            }
            _ = shutdown.cancelled() => Err(LockError::Cancelled {
                path: self.path.clone(),
            }),
        }
    }

    /// Delete the lock ourselves. A lock that is already gone is fine.
    pub fn force_remove(&self) -> LockResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "update lock force-removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn lock_in(dir: &TempDir) -> UpdateLock {
        UpdateLock::new(dir.path().join("dbc-update.lock"), Duration::from_secs(1))
    }

    #[test]
    fn create_writes_decimal_timestamp() {
        let dir = TempDir::new().expect("tempdir");
        let lock = lock_in(&dir);
        let before = Utc::now().timestamp();
        lock.create().expect("create");
        let raw = fs::read_to_string(lock.path()).expect("read");
        let stamp: i64 = raw.parse().expect("decimal timestamp");
        assert!(stamp >= before && stamp <= Utc::now().timestamp());
        assert_eq!(lock.created_at().map(|t| t.timestamp()), Some(stamp));
    }

    #[test]
    fn create_fails_in_missing_directory() {
        let dir = TempDir::new().expect("tempdir");
        let lock = UpdateLock::new(dir.path().join("missing/dbc-update.lock"), Duration::from_secs(1));
        assert!(matches!(lock.create(), Err(LockError::Create { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_lock_returns_immediately() {
        let dir = TempDir::new().expect("tempdir");
        let started = Instant::now();
        lock_in(&dir)
            .await_removal(Duration::from_secs(10), &ShutdownSignal::never())
            .await
            .expect("already absent");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_by_updater_is_observed() {
        let dir = TempDir::new().expect("tempdir");
        let lock = lock_in(&dir);
        lock.create().expect("create");
        let path = lock.path().to_path_buf();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            fs::remove_file(path).expect("updater removes lock");
        });
        let started = Instant::now();
        lock.await_removal(Duration::from_secs(10), &ShutdownSignal::never())
            .await
            .expect("removed");
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_forced_removal_then_immediate_success() {
        let dir = TempDir::new().expect("tempdir");
        let lock = lock_in(&dir);
        lock.create().expect("create");

        let err = lock
            .await_removal(Duration::from_secs(3), &ShutdownSignal::never())
            .await
            .expect_err("never removed");
        assert!(matches!(err, LockError::TimedOut { waited, .. } if waited == Duration::from_secs(3)));

        lock.force_remove().expect("force remove");
        assert!(!lock.exists());
        lock.force_remove().expect("second removal is a no-op");
        lock.await_removal(Duration::from_secs(3), &ShutdownSignal::never())
            .await
            .expect("absent now");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let dir = TempDir::new().expect("tempdir");
        let lock = lock_in(&dir);
        lock.create().expect("create");
        let (trigger, signal) = shutdown_channel();
        trigger.trigger();
        let err = lock
            .await_removal(Duration::from_secs(60), &signal)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, LockError::Cancelled { .. }));
    }
}
