//! Self-state monitoring.
//!
//! Watches the pipeline itself: store reachability and the `MetricReceived`
//! and `LastCheck` heartbeats. A condition that holds longer than its delay
//! is sent as an `ERROR` event straight to the configured contacts, at most
//! once per `notice_interval`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, tick};

use crate::config::SelfStateConfig;
use crate::error::{spawn_error, TripwireResult};
use crate::metrics::PipelineMetrics;
use crate::notifier::{NotificationPackage, NotifierHandle};
use crate::shutdown::ShutdownSignal;
use crate::storage::{HeartbeatKind, HeartbeatStore, Store};
use crate::time::SharedClock;
use crate::trigger::{CheckState, Event, Trigger, TriggerId};

/// Name of the synthetic trigger self-state alerts are attributed to.
pub const SELF_STATE_TRIGGER_NAME: &str = "Tripwire self-state";

/// A health condition watched by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Condition {
    /// The store did not answer a ping for longer than `redis_disconnect_delay`.
    StoreUnreachable,
    /// No sample matched a pattern for longer than `last_metric_received_delay`.
    NoMetricsReceived,
    /// No trigger check completed for longer than `last_check_delay`.
    NoChecksCompleted,
}

impl Condition {
    /// Short identifier, used as the event's metric name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StoreUnreachable => "store_unreachable",
            Self::NoMetricsReceived => "no_metrics_received",
            Self::NoChecksCompleted => "no_checks_completed",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raised condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// What went wrong.
    pub condition: Condition,
    /// Seconds the condition has held.
    pub elapsed: i64,
}

impl Alert {
    fn message(&self) -> String {
        match self.condition {
            Condition::StoreUnreachable => format!("store unreachable for {}s", self.elapsed),
            Condition::NoMetricsReceived => format!("no metrics received for {}s", self.elapsed),
            Condition::NoChecksCompleted => format!("no trigger checks completed for {}s", self.elapsed),
        }
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

/// Periodic health checker.
pub struct SelfStateMonitor {
    cfg: SelfStateConfig,
    store: Arc<dyn Store>,
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
    notifier: Option<NotifierHandle>,
    started_at: i64,
    last_ping_ok: i64,
    last_notice: HashMap<Condition, i64>,
}

impl SelfStateMonitor {
    /// Creates a monitor; missing heartbeats count from now.
    #[must_use]
    pub fn new(
        cfg: SelfStateConfig,
        store: Arc<dyn Store>,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let now = clock.now_unix();
        Self {
            cfg,
            store,
            clock,
            metrics,
            notifier: None,
            started_at: now,
            last_ping_ok: now,
            last_notice: HashMap::new(),
        }
    }

    /// Delivers alerts through `notifier`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: NotifierHandle) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Runs one round of checks and returns the alerts that were sent.
    pub fn check(&mut self) -> Vec<Alert> {
        self.metrics.self_state.checks.inc();
        let now = self.clock.now_unix();
        let mut raised = Vec::new();

        match self.store.ping() {
            Ok(()) => self.last_ping_ok = now,
            Err(e) => tracing::debug!(error = %e, "store ping failed"),
        }
        let unreachable_for = now - self.last_ping_ok;
        if unreachable_for > secs(self.cfg.redis_disconnect_delay) {
            raised.push(Alert {
                condition: Condition::StoreUnreachable,
                elapsed: unreachable_for,
            });
        } else if unreachable_for == 0 {
            // Heartbeats are only meaningful while the store answers.
            for (kind, condition, delay) in [
                (
                    HeartbeatKind::MetricReceived,
                    Condition::NoMetricsReceived,
                    self.cfg.last_metric_received_delay,
                ),
                (
                    HeartbeatKind::LastCheck,
                    Condition::NoChecksCompleted,
                    self.cfg.last_check_delay,
                ),
            ] {
                let last = match self.store.get_heartbeat(kind) {
                    Ok(ts) => ts.unwrap_or(self.started_at).max(self.started_at),
                    Err(e) => {
                        tracing::warn!(heartbeat = ?kind, error = %e, "failed to read heartbeat");
                        continue;
                    }
                };
                let elapsed = now - last;
                if elapsed > secs(delay) {
                    raised.push(Alert { condition, elapsed });
                }
            }
        }

        let notice = secs(self.cfg.notice_interval);
        raised.retain(|alert| match self.last_notice.get(&alert.condition) {
            Some(&at) if now - at < notice => {
                self.metrics.self_state.suppressed.inc();
                false
            }
            _ => true,
        });
        for alert in &raised {
            self.last_notice.insert(alert.condition, now);
            self.metrics.self_state.raised.inc();
            tracing::error!(condition = %alert.condition, elapsed = alert.elapsed, "{}", alert.message());
        }
        if !raised.is_empty() {
            self.notify(&raised, now);
        }
        raised
    }

    fn notify(&self, alerts: &[Alert], now: i64) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let mut trigger = Trigger::new(SELF_STATE_TRIGGER_NAME, "tripwire.self_state");
        trigger.id = TriggerId::self_state();
        let events: Vec<Event> = alerts
            .iter()
            .map(|alert| {
                Event::transition(
                    trigger.id,
                    alert.condition.as_str(),
                    CheckState::Ok,
                    CheckState::Error,
                    now,
                )
                .with_message(alert.message())
            })
            .collect();

        for contact in &self.cfg.contacts {
            let package = NotificationPackage {
                trigger: trigger.clone(),
                contact: contact.clone(),
                events: events.clone(),
                throttled: false,
            };
            if let Err(e) = notifier.send_direct(package) {
                tracing::error!(contact = %contact.value, error = %e, "failed to queue self-state alert");
            }
        }
    }

    /// Runs [`check`](Self::check) every `check_interval` until shutdown.
    ///
    /// # Errors
    ///
    /// Thread spawn failure.
    pub fn spawn(mut self, shutdown: &ShutdownSignal) -> TripwireResult<JoinHandle<()>> {
        let stop = shutdown.receiver();
        let name = "tripwire-selfstate";
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let ticker = tick(self.cfg.check_interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            self.check();
                        }
                        recv(stop) -> _ => break,
                    }
                }
                tracing::debug!("self-state monitor stopped");
            })
            .map_err(|e| spawn_error(name, &e))
    }
}
