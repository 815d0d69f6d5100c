//! Configuration.
//!
//! Every section has defaults, so an empty document is a valid config.
//! Durations are written as `250ms`, `10s`, `5m`, `1h`, `M:SS` or a plain
//! number of seconds.
//!
//! ```
//! let cfg = tripwire::config::load_from_str("checker:\n  check_interval: 2s\n").unwrap();
//! assert_eq!(cfg.checker.check_interval.as_secs(), 2);
//! assert_eq!(cfg.checker.nodata_check_interval.as_secs(), 60);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::error::{TripwireResult, ValidationError};

/// Root configuration document.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub filter: FilterConfig,
    pub checker: CheckerConfig,
    pub notifier: NotifierConfig,
    pub self_state: SelfStateConfig,
}

/// Log output format.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// A retention rule: metric names matching `pattern` (a regex) are stored
/// at `retention` resolution.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub pattern: String,
    #[serde(with = "duration")]
    pub retention: Duration,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// TCP address for the line listener; empty disables it.
    pub listen: String,
    pub queue_capacity: usize,
    pub workers: usize,
    pub batch_size: usize,
    /// Longest a partial batch waits before it is stored.
    #[serde(with = "duration")]
    pub batch_timeout: Duration,
    #[serde(with = "duration")]
    pub pattern_refresh_interval: Duration,
    pub retentions: Vec<RetentionRule>,
    #[serde(with = "duration")]
    pub default_retention: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2003".to_string(),
            queue_capacity: 65_536,
            workers: 2,
            batch_size: 256,
            batch_timeout: Duration::from_millis(100),
            pattern_refresh_interval: Duration::from_secs(1),
            retentions: Vec::new(),
            default_retention: Duration::from_secs(60),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    #[serde(with = "duration")]
    pub check_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(60),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    #[serde(with = "duration")]
    pub check_interval: Duration,
    #[serde(with = "duration")]
    pub nodata_check_interval: Duration,
    #[serde(with = "duration")]
    pub metrics_ttl: Duration,
    #[serde(with = "duration")]
    pub stop_checking_interval: Duration,
    /// Worker count; 0 means available parallelism.
    pub max_parallel_checks: usize,
    #[serde(with = "duration")]
    pub lock_ttl: Duration,
    pub queue_capacity: usize,
    pub remote: RemoteConfig,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            nodata_check_interval: Duration::from_secs(60),
            metrics_ttl: Duration::from_secs(3600),
            stop_checking_interval: Duration::from_secs(30),
            max_parallel_checks: 0,
            lock_ttl: Duration::from_secs(30),
            queue_capacity: 4096,
            remote: RemoteConfig::default(),
        }
    }
}

impl CheckerConfig {
    /// Resolved worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        if self.max_parallel_checks > 0 {
            self.max_parallel_checks
        } else {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        }
    }
}

/// A sender declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderSettings {
    /// Contact type routed to this sender.
    pub name: String,
    /// Sender implementation: `script` or `log`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Implementation-specific options.
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Bound on one delivery attempt; also the throttling window.
    #[serde(with = "duration")]
    pub sender_timeout: Duration,
    /// Upper bound on the resend backoff delay.
    #[serde(with = "duration")]
    pub resending_timeout: Duration,
    pub max_resend_attempts: u32,
    #[serde(with = "duration")]
    pub resend_base_delay: Duration,
    pub event_queue_capacity: usize,
    pub mailbox_capacity: usize,
    pub front_uri: String,
    pub senders: Vec<SenderSettings>,
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            sender_timeout: Duration::from_secs(10),
            resending_timeout: Duration::from_secs(60),
            max_resend_attempts: 5,
            resend_base_delay: Duration::from_secs(1),
            event_queue_capacity: 4096,
            mailbox_capacity: 1024,
            front_uri: "http://localhost".to_string(),
            senders: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfStateConfig {
    pub enabled: bool,
    #[serde(with = "duration")]
    pub check_interval: Duration,
    #[serde(with = "duration", alias = "redis_disconect_delay")]
    pub redis_disconnect_delay: Duration,
    #[serde(with = "duration")]
    pub last_metric_received_delay: Duration,
    #[serde(with = "duration")]
    pub last_check_delay: Duration,
    #[serde(with = "duration")]
    pub notice_interval: Duration,
    /// Contacts that receive self-state alerts.
    pub contacts: Vec<Contact>,
}

impl Default for SelfStateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(10),
            redis_disconnect_delay: Duration::from_secs(30),
            last_metric_received_delay: Duration::from_secs(60),
            last_check_delay: Duration::from_secs(60),
            notice_interval: Duration::from_secs(300),
            contacts: Vec::new(),
        }
    }
}

impl Config {
    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the offending key.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |reason: &str| ValidationError::InvalidConfig {
            reason: reason.to_string(),
        };

        let nonzero = [
            ("filter.pattern_refresh_interval", self.filter.pattern_refresh_interval),
            ("filter.default_retention", self.filter.default_retention),
            ("checker.check_interval", self.checker.check_interval),
            ("checker.nodata_check_interval", self.checker.nodata_check_interval),
            ("checker.metrics_ttl", self.checker.metrics_ttl),
            ("checker.lock_ttl", self.checker.lock_ttl),
            ("checker.remote.check_interval", self.checker.remote.check_interval),
            ("notifier.sender_timeout", self.notifier.sender_timeout),
            ("self_state.check_interval", self.self_state.check_interval),
        ];
        for (key, value) in nonzero {
            if value.is_zero() {
                return Err(fail(&format!("{key} must be > 0")));
            }
        }
        if self.filter.workers == 0 || self.filter.batch_size == 0 {
            return Err(fail("filter.workers and filter.batch_size must be > 0"));
        }
        if self.filter.retentions.iter().any(|r| r.retention.as_secs() == 0) {
            return Err(fail("filter.retentions entries must be at least 1s"));
        }
        if self.log.level.trim().is_empty() {
            return Err(fail("log.level must not be empty"));
        }

        let mut names = HashSet::new();
        for sender in &self.notifier.senders {
            if sender.name.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "notifier.senders.name".to_string(),
                });
            }
            if !names.insert(sender.name.as_str()) {
                return Err(ValidationError::DuplicateSender {
                    name: sender.name.clone(),
                });
            }
        }

        if self.self_state.enabled && self.self_state.contacts.is_empty() {
            return Err(fail("self_state.contacts must not be empty when enabled"));
        }
        Ok(())
    }
}

/// Reads and validates a YAML config file.
///
/// # Errors
///
/// I/O failures, YAML errors and validation failures.
pub fn load_from_file(path: &Path) -> TripwireResult<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Parses and validates a YAML config document.
///
/// # Errors
///
/// YAML errors are reported as `ValidationError::InvalidConfig`.
pub fn load_from_str(yaml: &str) -> TripwireResult<Config> {
    let cfg: Config = if yaml.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(yaml).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Parses a human-written duration.
///
/// # Errors
///
/// Returns `ValidationError::InvalidDuration` for anything unrecognised.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tripwire::config::parse_duration;
///
/// assert_eq!(parse_duration("1:30").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
/// ```
pub fn parse_duration(raw: &str) -> Result<Duration, ValidationError> {
    let s = raw.trim();
    let invalid = |reason: &str| ValidationError::InvalidDuration {
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let number = |digits: &str| -> Result<u64, ValidationError> {
        digits
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("expected a non-negative integer"))
    };

    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if let Some((minutes, seconds)) = s.split_once(':') {
        let minutes = number(minutes)?;
        let seconds = number(seconds)?;
        if seconds >= 60 {
            return Err(invalid("seconds must be below 60"));
        }
        return Ok(Duration::from_secs(minutes * 60 + seconds));
    }

    let (digits, unit_ms) = if let Some(d) = s.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = s.strip_suffix('s') {
        (d, 1_000)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 60_000)
    } else if let Some(d) = s.strip_suffix('h') {
        (d, 3_600_000)
    } else {
        (s, 1_000)
    };
    number(digits)?
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid("overflow"))
}

/// Formats a duration the way [`parse_duration`] reads it.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || (d.as_secs() == 0 && !d.is_zero()) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Serde adapter for [`Duration`] fields.
pub mod duration {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    /// Serializes as a duration string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    /// Deserializes from a duration string or a number of seconds.
    ///
    /// # Errors
    ///
    /// Fails on negative numbers and unparsable strings.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"10s\", \"5m\", \"1:00\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = load_from_str("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.checker.check_interval, Duration::from_secs(5));
        assert_eq!(cfg.checker.metrics_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.notifier.resending_timeout, Duration::from_secs(60));
        assert_eq!(cfg.self_state.notice_interval, Duration::from_secs(300));
        assert!(!cfg.self_state.enabled);
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
log:
  level: debug
  format: json
filter:
  listen: "127.0.0.1:2003"
  retentions:
    - pattern: "^servers\\."
      retention: 10s
checker:
  check_interval: 2s
  max_parallel_checks: 4
  remote:
    enabled: true
    check_interval: 1m
notifier:
  resending_timeout: "1:00"
  senders:
    - name: ops-log
      type: log
    - name: pager
      type: script
      exec: /usr/local/bin/page ${contact_value}
self_state:
  enabled: true
  redis_disconect_delay: 45
  contacts:
    - type: ops-log
      value: admins
"#;
        let cfg = load_from_str(yaml).unwrap();
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.filter.retentions[0].retention, Duration::from_secs(10));
        assert_eq!(cfg.checker.workers(), 4);
        assert_eq!(cfg.checker.remote.check_interval, Duration::from_secs(60));
        assert_eq!(cfg.notifier.resending_timeout, Duration::from_secs(60));
        assert_eq!(cfg.notifier.senders[1].kind, "script");
        assert!(cfg.notifier.senders[1].options.contains_key("exec"));
        assert_eq!(cfg.self_state.redis_disconnect_delay, Duration::from_secs(45));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = load_from_str("checker:\n  check_interval: 0\n").unwrap_err();
        assert!(err.to_string().contains("checker.check_interval"));

        let err = load_from_str("checker:\n  check_interval: soon\n").unwrap_err();
        assert!(err.is_validation());

        let dup = "notifier:\n  senders:\n    - {name: a, type: log}\n    - {name: a, type: log}\n";
        assert!(load_from_str(dup).unwrap_err().to_string().contains("Duplicate"));

        let lonely = "self_state:\n  enabled: true\n";
        assert!(load_from_str(lonely).is_err());
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("1:75").is_err());
        assert!(parse_duration("-3s").is_err());
        assert!(parse_duration("").is_err());
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
    }

    #[test]
    fn defaults_round_trip_through_yaml() {
        let yaml = serde_yaml::to_string(&Config::default()).unwrap();
        assert_eq!(load_from_str(&yaml).unwrap(), Config::default());
    }

    #[test]
    fn load_from_file_works() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tripwire.yml");
        std::fs::write(&path, "notifier:\n  front_uri: https://alerts\n").unwrap();
        let cfg = load_from_file(&path).unwrap();
        assert_eq!(cfg.notifier.front_uri, "https://alerts");
    }
}
