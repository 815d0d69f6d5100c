//! Abstract storage traits for tripwire.
//!
//! Every stage talks to the backing store only through these traits, so the
//! pipeline runs unchanged against the in-memory backend in tests and
//! against a networked backend in production. Implementations must be safe
//! to share between threads; mutations that race (check locks, the
//! "to check" set) must be atomic.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contact::{Contact, ContactId, Subscription};
use crate::metric::{MatchedMetric, MetricValue};
use crate::trigger::{CheckData, Trigger, TriggerId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Trigger not found.
    #[error("Trigger not found: {0}")]
    TriggerNotFound(TriggerId),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Returns true for transport-level failures that may clear up on their own.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

/// Liveness markers written by the pipeline and read by the self-state monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    /// Set by the filter after every stored batch.
    MetricReceived,
    /// Set by the checker after every completed evaluation.
    LastCheck,
}

/// Storage for the pattern → trigger mapping read by the filter.
pub trait PatternStore: Send + Sync {
    /// All patterns referenced by at least one trigger.
    fn get_patterns(&self) -> Result<Vec<String>, StorageError>;

    /// Triggers that registered `pattern`.
    fn get_pattern_triggers(&self, pattern: &str) -> Result<Vec<TriggerId>, StorageError>;
}

/// Storage for trigger definitions and the pending-check set.
pub trait TriggerStore: Send + Sync {
    /// Get a trigger by ID.
    fn get_trigger(&self, id: TriggerId) -> Result<Option<Trigger>, StorageError>;

    /// Insert or replace a trigger, registering its patterns.
    fn save_trigger(&self, trigger: Trigger) -> Result<(), StorageError>;

    /// Delete a trigger and unregister its patterns. Returns error if not found.
    fn remove_trigger(&self, id: TriggerId) -> Result<(), StorageError>;

    /// Ids of triggers evaluated against local data.
    fn get_local_trigger_ids(&self) -> Result<Vec<TriggerId>, StorageError>;

    /// Ids of triggers evaluated by a remote evaluator.
    fn get_remote_trigger_ids(&self) -> Result<Vec<TriggerId>, StorageError>;

    /// Mark triggers as having fresh data.
    fn add_triggers_to_check(&self, ids: &[TriggerId]) -> Result<(), StorageError>;

    /// Atomically take and clear the set of triggers with fresh data.
    fn take_triggers_to_check(&self) -> Result<Vec<TriggerId>, StorageError>;
}

/// Storage for time series buckets.
pub trait MetricStore: Send + Sync {
    /// Append matched samples to their series and index names by pattern.
    fn save_metrics(&self, metrics: &[MatchedMetric]) -> Result<(), StorageError>;

    /// Metric names that have matched `pattern`.
    fn get_pattern_metrics(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    /// Points of a series with `from <= timestamp <= until`, ascending.
    fn get_metric_values(
        &self,
        name: &str,
        from: i64,
        until: i64,
    ) -> Result<Vec<MetricValue>, StorageError>;

    /// Remove points older than `before`. An emptied series is forgotten.
    fn remove_metric_values(&self, name: &str, before: i64) -> Result<(), StorageError>;
}

/// Storage for recorded check results and per-trigger check locks.
pub trait CheckStore: Send + Sync {
    /// Recorded state of a trigger, if it has been checked before.
    fn get_check_data(&self, id: TriggerId) -> Result<Option<CheckData>, StorageError>;

    /// Replace the recorded state of a trigger.
    fn set_check_data(&self, id: TriggerId, data: &CheckData) -> Result<(), StorageError>;

    /// Try to take the check lock for `id`. Returns `false` if another holder
    /// owns an unexpired lock. The lock expires on its own after `ttl`.
    fn acquire_check_lock(&self, id: TriggerId, ttl: Duration) -> Result<bool, StorageError>;

    /// Release the check lock for `id`.
    fn release_check_lock(&self, id: TriggerId) -> Result<(), StorageError>;
}

/// Storage for liveness markers.
pub trait HeartbeatStore: Send + Sync {
    /// Round-trip to the backend.
    fn ping(&self) -> Result<(), StorageError>;

    /// Record a heartbeat at unix time `timestamp`.
    fn set_heartbeat(&self, kind: HeartbeatKind, timestamp: i64) -> Result<(), StorageError>;

    /// Last recorded heartbeat.
    fn get_heartbeat(&self, kind: HeartbeatKind) -> Result<Option<i64>, StorageError>;
}

/// Storage for contacts and subscriptions.
pub trait SubscriptionStore: Send + Sync {
    /// Enabled subscriptions that select `trigger`.
    fn get_trigger_subscriptions(&self, trigger: &Trigger)
        -> Result<Vec<Subscription>, StorageError>;

    /// Get a contact by ID.
    fn get_contact(&self, id: ContactId) -> Result<Option<Contact>, StorageError>;

    /// Insert or replace a contact.
    fn save_contact(&self, contact: Contact) -> Result<(), StorageError>;

    /// Insert or replace a subscription.
    fn save_subscription(&self, subscription: Subscription) -> Result<(), StorageError>;
}

/// Everything the pipeline needs from a backend.
pub trait Store:
    PatternStore + TriggerStore + MetricStore + CheckStore + HeartbeatStore + SubscriptionStore
{
}

impl<T> Store for T where
    T: PatternStore + TriggerStore + MetricStore + CheckStore + HeartbeatStore + SubscriptionStore
{
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_pattern_store_object_safe(_: &dyn PatternStore) {}
    fn _assert_trigger_store_object_safe(_: &dyn TriggerStore) {}
    fn _assert_metric_store_object_safe(_: &dyn MetricStore) {}
    fn _assert_check_store_object_safe(_: &dyn CheckStore) {}
    fn _assert_heartbeat_store_object_safe(_: &dyn HeartbeatStore) {}
    fn _assert_subscription_store_object_safe(_: &dyn SubscriptionStore) {}
    fn _assert_store_object_safe(_: &dyn Store) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::TriggerNotFound(TriggerId::new());
        assert!(err.to_string().contains("Trigger not found"));

        let err = StorageError::ConnectionError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_connection());
        assert!(!StorageError::BackendError("x".to_string()).is_connection());
    }
}
