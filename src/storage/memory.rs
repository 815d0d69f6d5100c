//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of every
//! storage trait. It is intended for embedded usage, tests, and as a
//! reference implementation. An outage can be simulated with
//! [`InMemoryStore::set_unavailable`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId, Subscription};
use crate::metric::{MatchedMetric, MetricValue};
use crate::storage::traits::{
    CheckStore, HeartbeatKind, HeartbeatStore, MetricStore, PatternStore, StorageError,
    SubscriptionStore, TriggerStore,
};
use crate::trigger::{CheckData, Trigger, TriggerId};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct TriggerState {
    by_id: HashMap<TriggerId, Trigger>,
    by_pattern: BTreeMap<String, BTreeSet<TriggerId>>,
    to_check: BTreeSet<TriggerId>,
}

impl TriggerState {
    fn unregister(&mut self, trigger: &Trigger) {
        for pattern in trigger.effective_patterns() {
            if let Some(ids) = self.by_pattern.get_mut(pattern) {
                ids.remove(&trigger.id);
                if ids.is_empty() {
                    self.by_pattern.remove(pattern);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct SeriesState {
    values: HashMap<String, BTreeMap<i64, f64>>,
    by_pattern: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    contacts: HashMap<ContactId, Contact>,
    subscriptions: Vec<Subscription>,
}

/// Reference backend holding everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    triggers: RwLock<TriggerState>,
    series: RwLock<SeriesState>,
    checks: RwLock<HashMap<TriggerId, CheckData>>,
    locks: Mutex<HashMap<TriggerId, Instant>>,
    heartbeats: RwLock<HashMap<HeartbeatKind, i64>>,
    subscriptions: RwLock<SubscriptionState>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated from fixtures.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::BackendError` if a fixture trigger fails validation.
    pub fn from_fixtures(fixtures: Fixtures) -> Result<Self, StorageError> {
        let store = Self::new();
        for trigger in fixtures.triggers {
            trigger
                .validate()
                .map_err(|e| StorageError::BackendError(e.to_string()))?;
            store.save_trigger(trigger)?;
        }
        for contact in fixtures.contacts {
            store.save_contact(contact)?;
        }
        for subscription in fixtures.subscriptions {
            store.save_subscription(subscription)?;
        }
        Ok(store)
    }

    /// Make every subsequent call fail with `ConnectionError` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn available(&self, op: &str) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError(format!(
                "store unavailable during {op}"
            )));
        }
        Ok(())
    }
}

/// Triggers, contacts and subscriptions to preload into an [`InMemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixtures {
    pub triggers: Vec<Trigger>,
    pub contacts: Vec<Contact>,
    pub subscriptions: Vec<Subscription>,
}

impl PatternStore for InMemoryStore {
    fn get_patterns(&self) -> Result<Vec<String>, StorageError> {
        self.available("pattern.get_patterns")?;
        let state = self
            .triggers
            .read()
            .map_err(|_| lock_err("pattern.get_patterns"))?;
        Ok(state.by_pattern.keys().cloned().collect())
    }

    fn get_pattern_triggers(&self, pattern: &str) -> Result<Vec<TriggerId>, StorageError> {
        self.available("pattern.get_pattern_triggers")?;
        let state = self
            .triggers
            .read()
            .map_err(|_| lock_err("pattern.get_pattern_triggers"))?;
        Ok(state
            .by_pattern
            .get(pattern)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }
}

impl TriggerStore for InMemoryStore {
    fn get_trigger(&self, id: TriggerId) -> Result<Option<Trigger>, StorageError> {
        self.available("trigger.get")?;
        let state = self.triggers.read().map_err(|_| lock_err("trigger.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn save_trigger(&self, trigger: Trigger) -> Result<(), StorageError> {
        self.available("trigger.save")?;
        let mut state = self.triggers.write().map_err(|_| lock_err("trigger.save"))?;
        if let Some(old) = state.by_id.remove(&trigger.id) {
            state.unregister(&old);
        }
        for pattern in trigger.effective_patterns() {
            state
                .by_pattern
                .entry(pattern.clone())
                .or_default()
                .insert(trigger.id);
        }
        state.by_id.insert(trigger.id, trigger);
        Ok(())
    }

    fn remove_trigger(&self, id: TriggerId) -> Result<(), StorageError> {
        self.available("trigger.remove")?;
        let mut state = self
            .triggers
            .write()
            .map_err(|_| lock_err("trigger.remove"))?;
        let trigger = state
            .by_id
            .remove(&id)
            .ok_or(StorageError::TriggerNotFound(id))?;
        state.unregister(&trigger);
        state.to_check.remove(&id);
        Ok(())
    }

    fn get_local_trigger_ids(&self) -> Result<Vec<TriggerId>, StorageError> {
        self.available("trigger.local_ids")?;
        let state = self
            .triggers
            .read()
            .map_err(|_| lock_err("trigger.local_ids"))?;
        let mut ids: Vec<_> = state
            .by_id
            .values()
            .filter(|t| !t.is_remote)
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn get_remote_trigger_ids(&self) -> Result<Vec<TriggerId>, StorageError> {
        self.available("trigger.remote_ids")?;
        let state = self
            .triggers
            .read()
            .map_err(|_| lock_err("trigger.remote_ids"))?;
        let mut ids: Vec<_> = state
            .by_id
            .values()
            .filter(|t| t.is_remote)
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn add_triggers_to_check(&self, ids: &[TriggerId]) -> Result<(), StorageError> {
        self.available("trigger.add_to_check")?;
        let mut state = self
            .triggers
            .write()
            .map_err(|_| lock_err("trigger.add_to_check"))?;
        state.to_check.extend(ids.iter().copied());
        Ok(())
    }

    fn take_triggers_to_check(&self) -> Result<Vec<TriggerId>, StorageError> {
        self.available("trigger.take_to_check")?;
        let mut state = self
            .triggers
            .write()
            .map_err(|_| lock_err("trigger.take_to_check"))?;
        Ok(std::mem::take(&mut state.to_check).into_iter().collect())
    }
}

impl MetricStore for InMemoryStore {
    fn save_metrics(&self, metrics: &[MatchedMetric]) -> Result<(), StorageError> {
        self.available("metric.save")?;
        let mut state = self.series.write().map_err(|_| lock_err("metric.save"))?;
        for m in metrics {
            state
                .values
                .entry(m.name.clone())
                .or_default()
                .insert(m.retention_timestamp, m.value);
            for pattern in &m.patterns {
                state
                    .by_pattern
                    .entry(pattern.clone())
                    .or_default()
                    .insert(m.name.clone());
            }
        }
        Ok(())
    }

    fn get_pattern_metrics(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.available("metric.pattern_metrics")?;
        let state = self
            .series
            .read()
            .map_err(|_| lock_err("metric.pattern_metrics"))?;
        Ok(state
            .by_pattern
            .get(pattern)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn get_metric_values(
        &self,
        name: &str,
        from: i64,
        until: i64,
    ) -> Result<Vec<MetricValue>, StorageError> {
        self.available("metric.values")?;
        if from > until {
            return Ok(Vec::new());
        }
        let state = self.series.read().map_err(|_| lock_err("metric.values"))?;
        Ok(state
            .values
            .get(name)
            .map(|points| {
                points
                    .range(from..=until)
                    .map(|(&timestamp, &value)| MetricValue { timestamp, value })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove_metric_values(&self, name: &str, before: i64) -> Result<(), StorageError> {
        self.available("metric.remove_values")?;
        let mut state = self
            .series
            .write()
            .map_err(|_| lock_err("metric.remove_values"))?;
        let emptied = match state.values.get_mut(name) {
            Some(points) => {
                *points = points.split_off(&before);
                points.is_empty()
            }
            None => false,
        };
        if emptied {
            state.values.remove(name);
            state.by_pattern.retain(|_, names| {
                names.remove(name);
                !names.is_empty()
            });
        }
        Ok(())
    }
}

impl CheckStore for InMemoryStore {
    fn get_check_data(&self, id: TriggerId) -> Result<Option<CheckData>, StorageError> {
        self.available("check.get")?;
        let state = self.checks.read().map_err(|_| lock_err("check.get"))?;
        Ok(state.get(&id).cloned())
    }

    fn set_check_data(&self, id: TriggerId, data: &CheckData) -> Result<(), StorageError> {
        self.available("check.set")?;
        let mut state = self.checks.write().map_err(|_| lock_err("check.set"))?;
        state.insert(id, data.clone());
        Ok(())
    }

    fn acquire_check_lock(&self, id: TriggerId, ttl: Duration) -> Result<bool, StorageError> {
        self.available("check.acquire_lock")?;
        let mut locks = self.locks.lock().map_err(|_| lock_err("check.acquire_lock"))?;
        let now = Instant::now();
        match locks.get(&id) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                locks.insert(id, now + ttl);
                Ok(true)
            }
        }
    }

    fn release_check_lock(&self, id: TriggerId) -> Result<(), StorageError> {
        self.available("check.release_lock")?;
        let mut locks = self.locks.lock().map_err(|_| lock_err("check.release_lock"))?;
        locks.remove(&id);
        Ok(())
    }
}

impl HeartbeatStore for InMemoryStore {
    fn ping(&self) -> Result<(), StorageError> {
        self.available("ping")
    }

    fn set_heartbeat(&self, kind: HeartbeatKind, timestamp: i64) -> Result<(), StorageError> {
        self.available("heartbeat.set")?;
        let mut beats = self
            .heartbeats
            .write()
            .map_err(|_| lock_err("heartbeat.set"))?;
        let slot = beats.entry(kind).or_insert(timestamp);
        *slot = (*slot).max(timestamp);
        Ok(())
    }

    fn get_heartbeat(&self, kind: HeartbeatKind) -> Result<Option<i64>, StorageError> {
        self.available("heartbeat.get")?;
        let beats = self
            .heartbeats
            .read()
            .map_err(|_| lock_err("heartbeat.get"))?;
        Ok(beats.get(&kind).copied())
    }
}

impl SubscriptionStore for InMemoryStore {
    fn get_trigger_subscriptions(
        &self,
        trigger: &Trigger,
    ) -> Result<Vec<Subscription>, StorageError> {
        self.available("subscription.for_trigger")?;
        let state = self
            .subscriptions
            .read()
            .map_err(|_| lock_err("subscription.for_trigger"))?;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.matches(trigger))
            .cloned()
            .collect())
    }

    fn get_contact(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        self.available("contact.get")?;
        let state = self
            .subscriptions
            .read()
            .map_err(|_| lock_err("contact.get"))?;
        Ok(state.contacts.get(&id).cloned())
    }

    fn save_contact(&self, contact: Contact) -> Result<(), StorageError> {
        self.available("contact.save")?;
        let mut state = self
            .subscriptions
            .write()
            .map_err(|_| lock_err("contact.save"))?;
        state.contacts.insert(contact.id, contact);
        Ok(())
    }

    fn save_subscription(&self, subscription: Subscription) -> Result<(), StorageError> {
        self.available("subscription.save")?;
        let mut state = self
            .subscriptions
            .write()
            .map_err(|_| lock_err("subscription.save"))?;
        match state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            Some(existing) => *existing = subscription,
            None => state.subscriptions.push(subscription),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(name: &str, ts: i64, value: f64, patterns: &[&str]) -> MatchedMetric {
        MatchedMetric {
            name: name.to_string(),
            value,
            timestamp: ts,
            retention_timestamp: ts,
            retention: 60,
            patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    #[test]
    fn trigger_save_registers_patterns() {
        let store = InMemoryStore::new();
        let t = Trigger::new("cpu", "servers.*.cpu").with_thresholds(Some(1.0), None);
        let id = t.id;
        store.save_trigger(t.clone()).unwrap();

        assert_eq!(store.get_patterns().unwrap(), vec!["servers.*.cpu".to_string()]);
        assert_eq!(store.get_pattern_triggers("servers.*.cpu").unwrap(), vec![id]);
        assert_eq!(store.get_local_trigger_ids().unwrap(), vec![id]);
        assert!(store.get_remote_trigger_ids().unwrap().is_empty());

        let mut moved = t;
        moved.patterns = vec!["servers.*.mem".to_string()];
        store.save_trigger(moved).unwrap();
        assert_eq!(store.get_patterns().unwrap(), vec!["servers.*.mem".to_string()]);

        store.remove_trigger(id).unwrap();
        assert!(store.get_patterns().unwrap().is_empty());
        assert!(matches!(
            store.remove_trigger(id),
            Err(StorageError::TriggerNotFound(_))
        ));
    }

    #[test]
    fn to_check_set_is_taken_once() {
        let store = InMemoryStore::new();
        let a = TriggerId::new();
        store.add_triggers_to_check(&[a, a]).unwrap();
        assert_eq!(store.take_triggers_to_check().unwrap(), vec![a]);
        assert!(store.take_triggers_to_check().unwrap().is_empty());
    }

    #[test]
    fn series_range_and_prune() {
        let store = InMemoryStore::new();
        store
            .save_metrics(&[
                matched("a.b", 60, 1.0, &["a.*"]),
                matched("a.b", 120, 2.0, &["a.*"]),
                matched("a.b", 180, 3.0, &["a.*"]),
            ])
            .unwrap();

        let values = store.get_metric_values("a.b", 100, 200).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].timestamp, 120);

        store.remove_metric_values("a.b", 180).unwrap();
        assert_eq!(store.get_metric_values("a.b", 0, 1000).unwrap().len(), 1);
        assert_eq!(store.get_pattern_metrics("a.*").unwrap(), vec!["a.b".to_string()]);

        store.remove_metric_values("a.b", 1000).unwrap();
        assert!(store.get_pattern_metrics("a.*").unwrap().is_empty());
    }

    #[test]
    fn check_lock_is_exclusive_until_release_or_expiry() {
        let store = InMemoryStore::new();
        let id = TriggerId::new();
        assert!(store.acquire_check_lock(id, Duration::from_secs(30)).unwrap());
        assert!(!store.acquire_check_lock(id, Duration::from_secs(30)).unwrap());
        store.release_check_lock(id).unwrap();
        assert!(store.acquire_check_lock(id, Duration::ZERO).unwrap());
        // A zero ttl lock is already expired.
        assert!(store.acquire_check_lock(id, Duration::from_secs(30)).unwrap());
    }

    #[test]
    fn heartbeats_only_move_forward() {
        let store = InMemoryStore::new();
        assert_eq!(store.get_heartbeat(HeartbeatKind::LastCheck).unwrap(), None);
        store.set_heartbeat(HeartbeatKind::LastCheck, 100).unwrap();
        store.set_heartbeat(HeartbeatKind::LastCheck, 50).unwrap();
        assert_eq!(store.get_heartbeat(HeartbeatKind::LastCheck).unwrap(), Some(100));
    }

    #[test]
    fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(store.ping().unwrap_err().is_connection());
        assert!(store.get_patterns().is_err());
        store.set_unavailable(false);
        assert!(store.ping().is_ok());
    }

    #[test]
    fn subscriptions_resolve_for_trigger() {
        let store = InMemoryStore::new();
        let contact = Contact::new("log", "ops");
        let t = Trigger::new("cpu", "a.b")
            .with_thresholds(Some(1.0), None)
            .with_tags(["prod"]);
        store.save_contact(contact.clone()).unwrap();
        store
            .save_subscription(Subscription::for_tags(vec![contact.id], ["prod"]))
            .unwrap();
        store
            .save_subscription(Subscription::for_tags(vec![contact.id], ["dev"]))
            .unwrap();

        let subs = store.get_trigger_subscriptions(&t).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(store.get_contact(contact.id).unwrap(), Some(contact));
    }

    #[test]
    fn fixtures_load_from_yaml() {
        let yaml = r#"
triggers:
  - name: load
    targets: ["servers.*.load"]
    warn_value: 5
    error_value: 10
    tags: [prod]
contacts:
  - id: 0f8fad5b-d9cb-469f-a165-70867728950e
    type: log
    value: ops
subscriptions:
  - contacts: [0f8fad5b-d9cb-469f-a165-70867728950e]
    tags: [prod]
"#;
        let fixtures: Fixtures = serde_yaml::from_str(yaml).unwrap();
        let store = InMemoryStore::from_fixtures(fixtures).unwrap();
        assert_eq!(store.get_local_trigger_ids().unwrap().len(), 1);
        assert_eq!(store.get_patterns().unwrap(), vec!["servers.*.load".to_string()]);
    }
}
