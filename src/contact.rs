//! Contacts and subscriptions.
//!
//! A subscription ties a set of contacts to triggers, either explicitly by
//! trigger id or through tags. A contact's `kind` names the sender that
//! delivers to it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::{CheckState, Event, Trigger, TriggerId};

/// Unique identifier for a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(Uuid);

impl ContactId {
    /// Create a new random contact id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ContactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A notification destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub id: ContactId,
    /// Sender name that delivers to this contact.
    #[serde(rename = "type")]
    pub kind: String,
    /// Address understood by the sender (a channel, a phone number, a path).
    pub value: String,
    #[serde(default)]
    pub user: String,
}

impl Contact {
    /// Creates a contact for the given sender.
    #[must_use]
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: ContactId::new(),
            kind: kind.into(),
            value: value.into(),
            user: String::new(),
        }
    }

    /// Sets the owning user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

const fn default_enabled() -> bool {
    true
}

/// Routes trigger events to contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub id: SubscriptionId,
    pub contacts: Vec<ContactId>,
    /// All of these tags must be present on the trigger.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Triggers matched regardless of tags.
    #[serde(default)]
    pub trigger_ids: Vec<TriggerId>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Skip transitions that stay within OK and WARN.
    #[serde(default)]
    pub ignore_warnings: bool,
    /// Skip transitions where severity decreases.
    #[serde(default)]
    pub ignore_recoverings: bool,
}

impl Subscription {
    /// Creates an enabled subscription on a tag set.
    #[must_use]
    pub fn for_tags<I, S>(contacts: Vec<ContactId>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: SubscriptionId::new(),
            contacts,
            tags: tags.into_iter().map(Into::into).collect(),
            trigger_ids: Vec::new(),
            enabled: true,
            ignore_warnings: false,
            ignore_recoverings: false,
        }
    }

    /// Creates an enabled subscription on explicit triggers.
    #[must_use]
    pub fn for_triggers(contacts: Vec<ContactId>, trigger_ids: Vec<TriggerId>) -> Self {
        Self {
            trigger_ids,
            ..Self::for_tags(contacts, Vec::<String>::new())
        }
    }

    /// Returns true if the subscription selects this trigger.
    ///
    /// An explicit id always matches. Otherwise a non-empty tag set must be a
    /// subset of the trigger's tags. Disabled subscriptions never match.
    #[must_use]
    pub fn matches(&self, trigger: &Trigger) -> bool {
        if !self.enabled {
            return false;
        }
        if self.trigger_ids.contains(&trigger.id) {
            return true;
        }
        !self.tags.is_empty() && self.tags.iter().all(|t| trigger.tags.contains(t))
    }

    /// Returns true if the event passes the `ignore_*` filters.
    #[must_use]
    pub fn accepts(&self, event: &Event) -> bool {
        let within_warn = |s: CheckState| matches!(s, CheckState::Ok | CheckState::Warn);
        if self.ignore_warnings && within_warn(event.old_state) && within_warn(event.new_state) {
            return false;
        }
        if self.ignore_recoverings && event.is_recovery() {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> Trigger {
        Trigger::new("cpu", "servers.*.cpu")
            .with_thresholds(Some(50.0), Some(75.0))
            .with_tags(["prod", "web"])
    }

    #[test]
    fn tag_subset_matches() {
        let t = trigger();
        assert!(Subscription::for_tags(vec![], ["prod"]).matches(&t));
        assert!(Subscription::for_tags(vec![], ["web", "prod"]).matches(&t));
        assert!(!Subscription::for_tags(vec![], ["prod", "db"]).matches(&t));
        assert!(!Subscription::for_tags(vec![], Vec::<String>::new()).matches(&t));
    }

    #[test]
    fn explicit_trigger_and_disabled() {
        let t = trigger();
        let mut sub = Subscription::for_triggers(vec![], vec![t.id]);
        assert!(sub.matches(&t));
        sub.enabled = false;
        assert!(!sub.matches(&t));
    }

    #[test]
    fn ignore_flags_filter_events() {
        let id = TriggerId::new();
        let mut sub = Subscription::for_tags(vec![], ["prod"]);
        sub.ignore_warnings = true;
        assert!(!sub.accepts(&Event::transition(id, "m", CheckState::Ok, CheckState::Warn, 1)));
        assert!(sub.accepts(&Event::transition(id, "m", CheckState::Warn, CheckState::Error, 1)));

        sub.ignore_recoverings = true;
        assert!(!sub.accepts(&Event::transition(id, "m", CheckState::Error, CheckState::Warn, 1)));
        assert!(sub.accepts(&Event::transition(id, "m", CheckState::Ok, CheckState::Error, 1)));
    }

    #[test]
    fn contact_uses_type_key() {
        let c: Contact = serde_json::from_str(r#"{"type":"log","value":"ops"}"#).unwrap();
        assert_eq!(c.kind, "log");
        assert!(c.user.is_empty());
    }
}
