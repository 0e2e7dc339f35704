//! Configration in TOML format
//!
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

#[derive(Clone, Debug)]
pub struct Settings {
    store_file: PathBuf,
    log_level: String,
    scan_interval: Duration,
    renew_before: chrono::Duration,
    failure_cooldown: chrono::Duration,
    propagation_wait: Duration,
    propagation_settle: Duration,
    nameservers: Vec<IpAddr>,
}

#[derive(serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    store_file: Option<PathBuf>,
    log_level: Option<String>,
    scan_interval_secs: Option<u64>,
    renew_before_days: Option<i64>,
    failure_cooldown_secs: Option<i64>,
    propagation_wait_secs: Option<u64>,
    propagation_settle_secs: Option<u64>,
    #[serde(default)]
    nameservers: Vec<IpAddr>,
}

/// Upper bound of every day-sized setting
const MAX_DAYS: i64 = 3650;

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_file: PathBuf::from("acme-renewal-store.json"),
            log_level: "info".to_string(),
            scan_interval: Duration::from_secs(24 * 3600),
            renew_before: chrono::Duration::days(21),
            failure_cooldown: chrono::Duration::hours(23),
            propagation_wait: Duration::from_secs(120),
            propagation_settle: Duration::from_secs(30),
            nameservers: Vec::new(),
        }
    }
}

impl TryFrom<SettingsToml> for Settings {
    type Error = Error;

    fn try_from(toml: SettingsToml) -> Result<Self, Error> {
        let defaults = Self::default();

        let scan_interval = match toml.scan_interval_secs {
            Some(0) => {
                return Err(Error::InvalidSetting(
                    "scan_interval_secs must be greater than 0".to_string(),
                ))
            }
            Some(secs) => Duration::from_secs(bounded_secs("scan_interval_secs", secs)?),
            None => defaults.scan_interval,
        };
        let renew_before = match toml.renew_before_days {
            Some(days) => days_setting("renew_before_days", days)?,
            None => defaults.renew_before,
        };
        let failure_cooldown = match toml.failure_cooldown_secs {
            Some(secs) if secs < 0 => {
                return Err(Error::InvalidSetting(format!(
                    "failure_cooldown_secs must not be negative, got {}",
                    secs
                )))
            }
            Some(secs) => {
                chrono::Duration::seconds(bounded_secs("failure_cooldown_secs", secs as u64)? as i64)
            }
            None => defaults.failure_cooldown,
        };
        let propagation_wait = match toml.propagation_wait_secs {
            Some(secs) => Duration::from_secs(bounded_secs("propagation_wait_secs", secs)?),
            None => defaults.propagation_wait,
        };
        let propagation_settle = match toml.propagation_settle_secs {
            Some(secs) => Duration::from_secs(bounded_secs("propagation_settle_secs", secs)?),
            None => defaults.propagation_settle,
        };

        Ok(Self {
            store_file: toml.store_file.unwrap_or(defaults.store_file),
            log_level: toml.log_level.unwrap_or(defaults.log_level),
            scan_interval,
            renew_before,
            failure_cooldown,
            propagation_wait,
            propagation_settle,
            nameservers: toml.nameservers,
        })
    }
}

fn bounded_secs(key: &str, secs: u64) -> Result<u64, Error> {
    if secs > (MAX_DAYS * 86400) as u64 {
        return Err(Error::InvalidSetting(format!(
            "{} is out of range: {}",
            key, secs
        )));
    }
    Ok(secs)
}

fn days_setting(key: &str, days: i64) -> Result<chrono::Duration, Error> {
    if !(0..=MAX_DAYS).contains(&days) {
        return Err(Error::InvalidSetting(format!(
            "{} must be within 0..={}, got {}",
            key, MAX_DAYS, days
        )));
    }
    Ok(chrono::Duration::days(days))
}

impl Settings {
    /// Missing file means defaults
    pub fn from_file<P: AsRef<std::path::Path>>(settings_file: P) -> Result<Self, Error> {
        match std::fs::read_to_string(settings_file) {
            Ok(toml_str) => Self::from_str(&toml_str),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self, Error> {
        let settings = toml::from_str::<SettingsToml>(toml_str)?;
        settings.try_into()
    }

    pub fn store_file(&self) -> &std::path::Path {
        self.store_file.as_path()
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_str()
    }

    /// Period of the expiry scanner
    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    /// Certificates expiring within this window are renewed
    pub fn renew_before(&self) -> chrono::Duration {
        self.renew_before
    }

    /// A domain that failed is not retried before this elapsed
    pub fn failure_cooldown(&self) -> chrono::Duration {
        self.failure_cooldown
    }

    /// Delay before checking the sentinel, and between unsuccessful checks
    pub fn propagation_wait(&self) -> Duration {
        self.propagation_wait
    }

    /// Extra delay after the sentinel is first seen
    pub fn propagation_settle(&self) -> Duration {
        self.propagation_settle
    }

    pub fn nameservers(&self) -> &[IpAddr] {
        self.nameservers.as_slice()
    }
}
