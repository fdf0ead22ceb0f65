//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "DBC power line control over the sysfs GPIO interface."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dbc_common::config::GpioConfig;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Result, UpdaterError};

/// Logic level written to the line's `value` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerLevel {
    Off,
    On,
}

impl PowerLevel {
    fn as_sysfs(&self) -> &'static str {
        match self {
            PowerLevel::Off => "0",
            PowerLevel::On => "1",
        }
    }
}

/// Result of an export request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Exported,
    AlreadyExported,
}

/// Drives the single GPIO line that enables DBC power.
///
/// Every write is attempted exactly once. Whether a failed write stops the
/// sequence is decided by the caller.
#[derive(Debug, Clone)]
pub struct PowerController {
    root: PathBuf,
    pin: u32,
    settle_delay: Duration,
}

impl PowerController {
    pub fn new(root: impl Into<PathBuf>, pin: u32) -> Self {
        Self {
            root: root.into(),
            pin,
            settle_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &GpioConfig) -> Self {
        Self::new(config.root.clone(), config.pin).with_settle_delay(config.settle_delay)
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn line_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    /// Export the line. A line that is already exported (for instance after
    /// an unclean restart) is reported as [`ExportState::AlreadyExported`].
    pub async fn export_line(&self) -> Result<ExportState> {
        if self.line_dir().is_dir() {
            debug!(pin = self.pin, "gpio line already exported");
            return Ok(ExportState::AlreadyExported);
        }
        let export = self.root.join("export");
        match fs::write(&export, self.pin.to_string()) {
            Ok(()) => {
                info!(pin = self.pin, "gpio line exported");
                sleep(self.settle_delay).await;
                Ok(ExportState::Exported)
            }
            Err(err) if is_already_exported(&err) => {
                debug!(pin = self.pin, error = %err, "export reported busy; line already exported");
                Ok(ExportState::AlreadyExported)
            }
            Err(source) => Err(self.write_error("export", export, source)),
        }
    }

    pub fn set_direction_out(&self) -> Result<()> {
        self.write_attribute("direction", "out")
    }

    pub fn set_value(&self, level: PowerLevel) -> Result<()> {
        self.write_attribute("value", level.as_sysfs())?;
        info!(pin = self.pin, level = ?level, "dbc power line driven");
        Ok(())
    }

    /// Export the line and configure it as an output.
    ///
    /// The direction write is attempted even when export failed; the export
    /// error is returned afterwards.
    pub async fn prepare(&self) -> Result<ExportState> {
        let exported = self.export_line().await;
        if let Err(err) = &exported {
            warn!(pin = self.pin, error = %err, "export failed; configuring direction anyway");
        }
        self.set_direction_out()?;
        exported
    }

    fn write_attribute(&self, attribute: &'static str, value: &str) -> Result<()> {
        let path = self.line_dir().join(attribute);
        fs::write(&path, value).map_err(|source| self.write_error(attribute, path, source))
    }

    fn write_error(&self, attribute: &'static str, path: impl AsRef<Path>, source: io::Error) -> UpdaterError {
        UpdaterError::Gpio {
            pin: self.pin,
            attribute,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// The kernel answers a repeated export with `EBUSY`.
pub fn is_already_exported(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBUSY)
}
