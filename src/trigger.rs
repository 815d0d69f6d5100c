//! Trigger, check state and event types.
//!
//! These types are serializable so they can be persisted by a store backend,
//! loaded from fixture files and handed to script senders as JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Unique identifier for a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    /// Create a new random trigger id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The reserved id used for self-state alerts.
    #[must_use]
    pub const fn self_state() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a metric or a trigger.
///
/// Variants are declared in severity order, so the derived `Ord` is the
/// worst-of ordering: `OK < NODATA < WARN < ERROR < EXCEPTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckState {
    #[default]
    Ok,
    Nodata,
    Warn,
    Error,
    Exception,
}

impl CheckState {
    /// Combines states by severity.
    ///
    /// # Examples
    ///
    /// ```
    /// use tripwire::CheckState;
    ///
    /// let worst = CheckState::worst_of([CheckState::Ok, CheckState::Warn, CheckState::Nodata]);
    /// assert_eq!(worst, CheckState::Warn);
    /// assert_eq!(CheckState::worst_of([]), CheckState::Ok);
    /// ```
    #[must_use]
    pub fn worst_of(states: impl IntoIterator<Item = Self>) -> Self {
        states.into_iter().max().unwrap_or_default()
    }

    /// Upper-case name, as shown in notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Nodata => "NODATA",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Exception => "EXCEPTION",
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_ttl_state() -> CheckState {
    CheckState::Nodata
}

/// A user-defined alerting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub id: TriggerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Target expressions handed to the evaluator.
    pub targets: Vec<String>,
    /// Patterns the filter matches samples against. Defaults to the targets.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub warn_value: Option<f64>,
    #[serde(default)]
    pub error_value: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_remote: bool,
    /// Seconds without data before a metric goes stale; 0 means the configured `metrics_ttl`.
    #[serde(default)]
    pub ttl_seconds: i64,
    /// State assigned to stale metrics.
    #[serde(default = "default_ttl_state")]
    pub ttl_state: CheckState,
}

impl Trigger {
    /// Creates a trigger over a single target, which also serves as its pattern.
    #[must_use]
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            id: TriggerId::new(),
            name: name.into(),
            desc: None,
            targets: vec![target.clone()],
            patterns: vec![target],
            warn_value: None,
            error_value: None,
            tags: Vec::new(),
            is_remote: false,
            ttl_seconds: 0,
            ttl_state: CheckState::Nodata,
        }
    }

    /// Sets warn and error thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, warn: Option<f64>, error: Option<f64>) -> Self {
        self.warn_value = warn;
        self.error_value = error;
        self
    }

    /// Replaces the tag list.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the trigger for remote evaluation.
    #[must_use]
    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }

    /// Sets a per-trigger staleness window.
    #[must_use]
    pub fn with_ttl(mut self, ttl_seconds: i64, ttl_state: CheckState) -> Self {
        self.ttl_seconds = ttl_seconds;
        self.ttl_state = ttl_state;
        self
    }

    /// Patterns to register with the filter; falls back to the targets.
    #[must_use]
    pub fn effective_patterns(&self) -> &[String] {
        if self.patterns.is_empty() {
            &self.targets
        } else {
            &self.patterns
        }
    }

    /// Staleness window in seconds.
    #[must_use]
    pub const fn ttl_or(&self, default_ttl: i64) -> i64 {
        if self.ttl_seconds > 0 {
            self.ttl_seconds
        } else {
            default_ttl
        }
    }

    /// Checks the trigger definition.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTrigger` for a missing name or target,
    /// or when neither threshold is set.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |reason: &str| ValidationError::InvalidTrigger {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(fail("name is empty"));
        }
        if self.targets.iter().all(|t| t.trim().is_empty()) {
            return Err(fail("at least one target is required"));
        }
        if self.warn_value.is_none() && self.error_value.is_none() {
            return Err(fail("warn_value or error_value must be set"));
        }
        if matches!(self.ttl_state, CheckState::Exception) {
            return Err(fail("ttl_state cannot be EXCEPTION"));
        }
        Ok(())
    }
}

/// Recorded state of one metric of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricState {
    pub state: CheckState,
    /// Timestamp of the newest processed point.
    pub timestamp: i64,
    pub value: Option<f64>,
}

/// A trigger's recorded check result (its `lastState` and `lastCheckTimestamp`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckData {
    pub state: CheckState,
    /// `now` of the evaluation that produced this record.
    pub timestamp: i64,
    /// Timestamp of the newest event emitted for this trigger.
    #[serde(default)]
    pub event_timestamp: i64,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckData {
    /// Newest data timestamp across all metrics.
    #[must_use]
    pub fn last_data_timestamp(&self) -> Option<i64> {
        self.metrics.values().map(|m| m.timestamp).max()
    }
}

/// A recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub trigger_id: TriggerId,
    /// Metric name, or the trigger name for trigger-level transitions.
    pub metric: String,
    pub old_state: CheckState,
    pub new_state: CheckState,
    pub timestamp: i64,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    /// Creates an event for an observed transition.
    #[must_use]
    pub fn transition(
        trigger_id: TriggerId,
        metric: impl Into<String>,
        old_state: CheckState,
        new_state: CheckState,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_id,
            metric: metric.into(),
            old_state,
            new_state,
            timestamp,
            value: None,
            message: None,
        }
    }

    /// Attaches the sample value.
    #[must_use]
    pub fn with_value(mut self, value: Option<f64>) -> Self {
        self.value = value;
        self
    }

    /// Attaches a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns true if severity went down.
    #[must_use]
    pub fn is_recovery(&self) -> bool {
        self.new_state < self.old_state
    }
}
