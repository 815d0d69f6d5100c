//! Pipeline counters.
//!
//! One [`PipelineMetrics`] is created per pipeline and passed explicitly to
//! every stage. Counters are relaxed atomics; a [`MetricsSnapshot`] is a
//! plain serializable copy taken at one point in time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n`.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct FilterMetrics {
    pub received: Counter,
    pub malformed: Counter,
    pub dropped: Counter,
    pub matched: Counter,
    pub unmatched: Counter,
    pub store_errors: Counter,
}

#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct CheckerMetrics {
    pub checks: Counter,
    pub skipped_locked: Counter,
    pub skipped_idle: Counter,
    pub exceptions: Counter,
    pub events: Counter,
    pub queue_full: Counter,
    pub store_errors: Counter,
}

#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct NotifierMetrics {
    pub events_received: Counter,
    pub sent: Counter,
    pub failed: Counter,
    pub throttled: Counter,
    pub dropped_mailbox: Counter,
    pub unroutable: Counter,
    pub resends: Counter,
    pub store_errors: Counter,
}

/// Delivery counters for one sender.
#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct SenderMetrics {
    pub sent: Counter,
    pub failed: Counter,
}

#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct SelfStateMetrics {
    pub checks: Counter,
    pub raised: Counter,
    pub suppressed: Counter,
}

/// Counters for every pipeline stage.
#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub filter: FilterMetrics,
    pub checker: CheckerMetrics,
    pub notifier: NotifierMetrics,
    pub self_state: SelfStateMetrics,
    senders: RwLock<BTreeMap<String, Arc<SenderMetrics>>>,
}

impl PipelineMetrics {
    /// Creates a shared metrics context.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counters for `sender`, created on first use.
    #[must_use]
    pub fn sender(&self, sender: &str) -> Arc<SenderMetrics> {
        if let Ok(map) = self.senders.read() {
            if let Some(m) = map.get(sender) {
                return Arc::clone(m);
            }
        }
        match self.senders.write() {
            Ok(mut map) => Arc::clone(map.entry(sender.to_string()).or_default()),
            // A poisoned map only loses per-sender detail.
            Err(_) => Arc::new(SenderMetrics::default()),
        }
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let senders = self
            .senders
            .read()
            .map(|map| {
                map.iter()
                    .map(|(name, m)| {
                        (
                            name.clone(),
                            SenderSnapshot {
                                sent: m.sent.get(),
                                failed: m.failed.get(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            filter: FilterSnapshot {
                received: self.filter.received.get(),
                malformed: self.filter.malformed.get(),
                dropped: self.filter.dropped.get(),
                matched: self.filter.matched.get(),
                unmatched: self.filter.unmatched.get(),
                store_errors: self.filter.store_errors.get(),
            },
            checker: CheckerSnapshot {
                checks: self.checker.checks.get(),
                skipped_locked: self.checker.skipped_locked.get(),
                skipped_idle: self.checker.skipped_idle.get(),
                exceptions: self.checker.exceptions.get(),
                events: self.checker.events.get(),
                queue_full: self.checker.queue_full.get(),
                store_errors: self.checker.store_errors.get(),
            },
            notifier: NotifierSnapshot {
                events_received: self.notifier.events_received.get(),
                sent: self.notifier.sent.get(),
                failed: self.notifier.failed.get(),
                throttled: self.notifier.throttled.get(),
                dropped_mailbox: self.notifier.dropped_mailbox.get(),
                unroutable: self.notifier.unroutable.get(),
                resends: self.notifier.resends.get(),
                store_errors: self.notifier.store_errors.get(),
                senders,
            },
            self_state: SelfStateSnapshot {
                checks: self.self_state.checks.get(),
                raised: self.self_state.raised.get(),
                suppressed: self.self_state.suppressed.get(),
            },
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub dropped: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub store_errors: u64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerSnapshot {
    pub checks: u64,
    pub skipped_locked: u64,
    pub skipped_idle: u64,
    pub exceptions: u64,
    pub events: u64,
    pub queue_full: u64,
    pub store_errors: u64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSnapshot {
    pub sent: u64,
    pub failed: u64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierSnapshot {
    pub events_received: u64,
    pub sent: u64,
    pub failed: u64,
    pub throttled: u64,
    pub dropped_mailbox: u64,
    pub unroutable: u64,
    pub resends: u64,
    pub store_errors: u64,
    pub senders: BTreeMap<String, SenderSnapshot>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfStateSnapshot {
    pub checks: u64,
    pub raised: u64,
    pub suppressed: u64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub filter: FilterSnapshot,
    pub checker: CheckerSnapshot,
    pub notifier: NotifierSnapshot,
    pub self_state: SelfStateSnapshot,
}
