//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Updater configuration model, defaults and environment overrides."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_update_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_signal_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_handoff_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_gpio_pin() -> u32 {
    50
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/tmp/dbc-update.lock")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_units() -> Vec<String> {
    vec!["librescoot-vehicle".to_owned(), "unu-vehicle".to_owned()]
}

fn default_systemctl() -> PathBuf {
    PathBuf::from("systemctl")
}

fn default_state_store_url() -> String {
    "redis://192.168.7.1:6379/0".to_owned()
}

/// Complete runtime configuration for one update session.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Upper bound on the wait for the external updater to remove the lock.
    #[serde(default = "default_update_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub update_timeout: Duration,
    /// Bound applied to readiness observation and to each pin-code operation.
    #[serde(default = "default_signal_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub signal_timeout: Duration,
    /// Pause between lock creation and the start of removal polling.
    #[serde(default = "default_handoff_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub handoff_delay: Duration,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub services: ServiceConfig,
    #[serde(default)]
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl UpdaterConfig {
    pub const ENV_REDIS_URL: &'static str = "DBC_UPDATER_REDIS_URL";
    pub const ENV_LOG_FORMAT: &'static str = "DBC_UPDATER_LOG_FORMAT";
    pub const ENV_LOG_DIR: &'static str = "DBC_UPDATER_LOG_DIR";

    /// Build the configuration from defaults and the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides resolved through `lookup`. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = get(Self::ENV_REDIS_URL) {
            debug!(key = Self::ENV_REDIS_URL, "state store url overridden");
            self.state_store.url = url.trim().to_owned();
        }
        if let Some(format) = get(Self::ENV_LOG_FORMAT) {
            self.logging.format = format
                .parse()
                .map_err(|err: String| anyhow!(err))
                .with_context(|| format!("invalid {}", Self::ENV_LOG_FORMAT))?;
        }
        if let Some(dir) = get(Self::ENV_LOG_DIR) {
            self.logging.directory = Some(PathBuf::from(dir.trim()));
        }
        Ok(())
    }

    /// Override the update wait bound, as done by the `--update-timeout` flag.
    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.services.validate()?;
        if self.lock.poll_interval.is_zero() {
            bail!("lock poll interval must be greater than zero");
        }
        if self.lock.path.as_os_str().is_empty() {
            bail!("lock path must not be empty");
        }
        if !self.state_store.url.contains("://") {
            return Err(anyhow!(
                "state store url '{}' is missing a scheme",
                self.state_store.url
            ));
        }
        Ok(())
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            update_timeout: default_update_timeout(),
            signal_timeout: default_signal_timeout(),
            handoff_delay: default_handoff_delay(),
            gpio: GpioConfig::default(),
            lock: LockConfig::default(),
            services: ServiceConfig::default(),
            state_store: StateStoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Sysfs GPIO line driving DBC power.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioConfig {
    #[serde(default = "default_gpio_root")]
    pub root: PathBuf,
    #[serde(default = "default_gpio_pin")]
    pub pin: u32,
    /// Time given to the kernel to create the line directory after export.
    #[serde(default = "default_settle_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_delay: Duration,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            root: default_gpio_root(),
            pin: default_gpio_pin(),
            settle_delay: default_settle_delay(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_path")]
    pub path: PathBuf,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: default_lock_path(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Vehicle services stopped for the duration of the update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_units")]
    pub units: Vec<String>,
    #[serde(default = "default_systemctl")]
    pub systemctl: PathBuf,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.units.is_empty() {
            bail!("at least one vehicle service unit must be configured");
        }
        if let Some(blank) = self.units.iter().find(|unit| unit.trim().is_empty()) {
            return Err(anyhow!("service unit name '{}' is blank", blank));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            units: default_units(),
            systemctl: default_systemctl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreConfig {
    #[serde(default = "default_state_store_url")]
    pub url: String,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            url: default_state_store_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// When set, a daily rolling JSON log is written here as well.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Parse a duration flag such as `30m`, `1h30m`, `1.5s` or `250ms`.
///
/// A bare integer is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let input = raw.trim();
    if input.is_empty() {
        return Err("duration must not be empty".to_owned());
    }
    if input.bytes().all(|b| b.is_ascii_digit()) {
        return input
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|err| format!("invalid duration '{raw}': {err}"));
    }

    let mut rest = input;
    let mut total_secs = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{raw}'"))?;
        if number_len == 0 {
            return Err(format!("expected a number in duration '{raw}'"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration '{raw}'"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown unit '{other}' in duration '{raw}'")),
        };
        total_secs += value * scale;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total_secs).map_err(|err| format!("invalid duration '{raw}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_vehicle_layout() {
        let config = UpdaterConfig::default();
        assert_eq!(config.update_timeout, Duration::from_secs(1800));
        assert_eq!(config.gpio.pin, 50);
        assert_eq!(config.lock.path, PathBuf::from("/tmp/dbc-update.lock"));
        assert_eq!(config.services.units, vec!["librescoot-vehicle", "unu-vehicle"]);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn overrides_apply_and_blank_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            (UpdaterConfig::ENV_REDIS_URL, "redis://127.0.0.1:6380/1"),
            (UpdaterConfig::ENV_LOG_FORMAT, "json"),
            (UpdaterConfig::ENV_LOG_DIR, "   "),
        ]);
        let mut config = UpdaterConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides apply");
        assert_eq!(config.state_store.url, "redis://127.0.0.1:6380/1");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn invalid_log_format_is_rejected() {
        let mut config = UpdaterConfig::default();
        let err = config
            .apply_overrides(|key| {
                (key == UpdaterConfig::ENV_LOG_FORMAT).then(|| "xml".to_owned())
            })
            .expect_err("unknown format");
        assert!(err.to_string().contains(UpdaterConfig::ENV_LOG_FORMAT));
    }

    #[test]
    fn validation_rejects_empty_service_set_and_zero_poll() {
        let mut config = UpdaterConfig::default();
        config.services.units.clear();
        assert!(config.validate().is_err());

        let mut config = UpdaterConfig::default();
        config.lock.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("5m3").is_err());
    }

    #[test]
    fn config_serializes_durations_as_millis() {
        let value = serde_json::to_value(UpdaterConfig::default()).expect("serializes");
        assert_eq!(value["update_timeout"], 1_800_000);
        assert_eq!(value["lock"]["poll_interval"], 1000);
    }
}
