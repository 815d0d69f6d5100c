//! One evaluation of one trigger.

use std::sync::Arc;

use crate::error::{TripwireError, TripwireResult};
use crate::metrics::PipelineMetrics;
use crate::storage::{
    CheckStore, HeartbeatKind, HeartbeatStore, MetricStore, PatternStore, Store, TriggerStore,
};
use crate::time::SharedClock;
use crate::trigger::{CheckData, CheckState, Trigger, TriggerId};

use super::evaluator::{EvaluationError, TargetEvaluator, TimeSeries};
use super::state::{apply_failure, apply_series, Transition};
use super::EventSink;

/// Points stamped up to this many seconds in the future are still read.
const FUTURE_TOLERANCE_SECS: i64 = 300;

/// What a call to [`TriggerChecker::check`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckReport {
    /// State was evaluated and recorded.
    Checked {
        /// Trigger state after the check.
        state: CheckState,
        /// Number of events published.
        events: usize,
        /// The trigger sits in its ttl state with no recent data.
        idle: bool,
    },
    /// The trigger no longer exists.
    Missing,
    /// A remote trigger and no remote evaluator is configured.
    NoEvaluator,
    /// The recorded state is newer than this evaluation.
    OutOfOrder,
}

/// Evaluates triggers and records the outcome.
#[derive(Clone)]
pub struct TriggerChecker {
    store: Arc<dyn Store>,
    local: Arc<dyn TargetEvaluator>,
    remote: Option<Arc<dyn TargetEvaluator>>,
    sink: Arc<dyn EventSink>,
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
    metrics_ttl: i64,
    stop_checking: i64,
}

impl TriggerChecker {
    /// Creates a checker.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        local: Arc<dyn TargetEvaluator>,
        remote: Option<Arc<dyn TargetEvaluator>>,
        sink: Arc<dyn EventSink>,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
        metrics_ttl_secs: i64,
        stop_checking_secs: i64,
    ) -> Self {
        Self {
            store,
            local,
            remote,
            sink,
            clock,
            metrics,
            metrics_ttl: metrics_ttl_secs,
            stop_checking: stop_checking_secs,
        }
    }

    /// Returns true if remote triggers can be evaluated.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Store handle, shared with the scheduler.
    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Metrics handle, shared with the scheduler.
    pub(crate) fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Evaluates one trigger, persists the new state, prunes old points and
    /// publishes events. The caller must hold the trigger's check lock.
    ///
    /// # Errors
    ///
    /// Store failures and an unreachable data source. Nothing is recorded in
    /// that case.
    pub fn check(&self, id: TriggerId) -> TripwireResult<CheckReport> {
        let Some(trigger) = self.store.get_trigger(id)? else {
            return Ok(CheckReport::Missing);
        };
        let evaluator = if trigger.is_remote {
            match &self.remote {
                Some(remote) => Arc::clone(remote),
                None => return Ok(CheckReport::NoEvaluator),
            }
        } else {
            Arc::clone(&self.local)
        };

        let previous = self.store.get_check_data(id)?;
        let now = self.clock.now_unix();
        if previous.as_ref().is_some_and(|p| now < p.timestamp) {
            return Ok(CheckReport::OutOfOrder);
        }
        let previous = previous.unwrap_or_default();

        let ttl = trigger.ttl_or(self.metrics_ttl);
        let from = now - ttl;
        let transition = match evaluate_all(evaluator.as_ref(), &trigger, from, now) {
            Ok(series) => {
                let transition = apply_series(&trigger, &previous, &series, now, ttl);
                self.finish(&trigger, &transition)?;
                if !trigger.is_remote {
                    self.prune(&trigger, &series, now);
                }
                transition
            }
            Err(e) if e.is_unavailable() => return Err(TripwireError::Evaluation(e)),
            Err(e) => {
                self.metrics.checker.exceptions.inc();
                tracing::warn!(trigger_id = %id, error = %e, "trigger evaluation failed");
                let transition = apply_failure(&trigger, &previous, &e.to_string(), now);
                self.finish(&trigger, &transition)?;
                transition
            }
        };

        let idle = self.is_idle(&trigger, &transition.data, now);
        Ok(CheckReport::Checked {
            state: transition.data.state,
            events: transition.events.len(),
            idle,
        })
    }

    fn finish(&self, trigger: &Trigger, transition: &Transition) -> TripwireResult<()> {
        self.store.set_check_data(trigger.id, &transition.data)?;
        for event in &transition.events {
            tracing::info!(
                trigger_id = %trigger.id,
                metric = %event.metric,
                old = %event.old_state,
                new = %event.new_state,
                "state changed"
            );
            if let Err(e) = self.sink.publish(event.clone()) {
                tracing::warn!(trigger_id = %trigger.id, error = %e, "failed to publish event");
            }
        }
        self.metrics.checker.checks.inc();
        self.metrics.checker.events.add(transition.events.len() as u64);
        self.store
            .set_heartbeat(HeartbeatKind::LastCheck, transition.data.timestamp)?;
        Ok(())
    }

    /// Drops points no trigger reading these series can still see. Series are
    /// shared, so the horizon is the longest TTL among the triggers on the same
    /// patterns, and never shorter than `metrics_ttl`.
    fn prune(&self, trigger: &Trigger, series: &[TimeSeries], now: i64) {
        let horizon = match self.retention_horizon(trigger) {
            Ok(h) => h,
            Err(e) => {
                self.metrics.checker.store_errors.inc();
                tracing::warn!(trigger_id = %trigger.id, error = %e, "skipping prune");
                return;
            }
        };
        let before = now.saturating_sub(horizon);
        for s in series {
            if let Err(e) = self.store.remove_metric_values(&s.name, before) {
                self.metrics.checker.store_errors.inc();
                tracing::warn!(metric = %s.name, error = %e, "failed to prune series");
            }
        }
    }

    fn retention_horizon(&self, trigger: &Trigger) -> TripwireResult<i64> {
        let mut horizon = self.metrics_ttl.max(trigger.ttl_or(self.metrics_ttl));
        for pattern in trigger.effective_patterns() {
            for id in self.store.get_pattern_triggers(pattern)? {
                if id == trigger.id {
                    continue;
                }
                if let Some(other) = self.store.get_trigger(id)? {
                    horizon = horizon.max(other.ttl_or(self.metrics_ttl));
                }
            }
        }
        Ok(horizon)
    }

    fn is_idle(&self, trigger: &Trigger, data: &CheckData, now: i64) -> bool {
        data.state == trigger.ttl_state
            && data
                .last_data_timestamp()
                .map_or(true, |ts| now - ts > self.stop_checking)
    }
}

fn evaluate_all(
    evaluator: &dyn TargetEvaluator,
    trigger: &Trigger,
    from: i64,
    now: i64,
) -> Result<Vec<TimeSeries>, EvaluationError> {
    let mut out = Vec::new();
    for target in &trigger.targets {
        out.extend(evaluator.evaluate(trigger, target, from, now + FUTURE_TOLERANCE_SECS)?);
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out.dedup_by(|a, b| a.name == b.name);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_channel::{unbounded, Receiver};

    use crate::checker::PatternEvaluator;
    use crate::metric::MatchedMetric;
    use crate::storage::InMemoryStore;
    use crate::time::ManualClock;
    use crate::trigger::Event;

    struct Harness {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        events: Receiver<Event>,
        checker: TriggerChecker,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let (tx, events) = unbounded();
        let checker = TriggerChecker::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(PatternEvaluator::new(Arc::clone(&store) as Arc<dyn Store>)),
            None,
            Arc::new(tx),
            Arc::clone(&clock) as SharedClock,
            PipelineMetrics::new(),
            600,
            30,
        );
        Harness {
            store,
            clock,
            events,
            checker,
        }
    }

    fn push(store: &InMemoryStore, name: &str, pattern: &str, ts: i64, value: f64) {
        store
            .save_metrics(&[MatchedMetric {
                name: name.to_string(),
                value,
                timestamp: ts,
                retention_timestamp: ts,
                retention: 60,
                patterns: vec![pattern.to_string()],
            }])
            .unwrap();
    }

    #[test]
    fn check_records_state_and_publishes() {
        let h = harness();
        let t = Trigger::new("load", "a.*").with_thresholds(Some(50.0), Some(75.0));
        h.store.save_trigger(t.clone()).unwrap();
        push(&h.store, "a.b", "a.*", 9_880, 40.0);
        push(&h.store, "a.b", "a.*", 9_940, 60.0);
        push(&h.store, "a.b", "a.*", 10_000, 80.0);

        let report = h.checker.check(t.id).unwrap();
        assert_eq!(
            report,
            CheckReport::Checked {
                state: CheckState::Error,
                events: 2,
                idle: false
            }
        );
        let published: Vec<_> = h.events.try_iter().collect();
        assert_eq!(published.len(), 2);
        assert_eq!(h.store.get_check_data(t.id).unwrap().unwrap().state, CheckState::Error);
        assert_eq!(
            h.store.get_heartbeat(HeartbeatKind::LastCheck).unwrap(),
            Some(10_000)
        );
    }

    #[test]
    fn short_ttl_trigger_keeps_data_for_longer_ttl_neighbour() {
        let h = harness();
        let short = Trigger::new("short", "a.*")
            .with_thresholds(None, Some(10.0))
            .with_ttl(60, CheckState::Nodata);
        let long = Trigger::new("long", "a.*").with_thresholds(None, Some(10.0));
        h.store.save_trigger(short.clone()).unwrap();
        h.store.save_trigger(long.clone()).unwrap();
        push(&h.store, "a.b", "a.*", 10_000, 1.0);
        h.checker.check(short.id).unwrap();
        h.checker.check(long.id).unwrap();

        h.clock.advance(120);
        let stale = h.checker.check(short.id).unwrap();
        assert!(matches!(stale, CheckReport::Checked { state: CheckState::Nodata, .. }));
        let report = h.checker.check(long.id).unwrap();
        assert!(matches!(report, CheckReport::Checked { state: CheckState::Ok, .. }));
        assert_eq!(h.store.get_metric_values("a.b", 0, 20_000).unwrap().len(), 1);
    }

    #[test]
    fn points_past_every_ttl_are_pruned() {
        let h = harness();
        let t = Trigger::new("load", "a.*").with_thresholds(None, Some(10.0));
        h.store.save_trigger(t.clone()).unwrap();
        push(&h.store, "a.b", "a.*", 9_000, 1.0);
        push(&h.store, "a.b", "a.*", 10_000, 2.0);
        h.checker.check(t.id).unwrap();
        let kept = h.store.get_metric_values("a.b", 0, 20_000).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].timestamp, 10_000);
    }

    #[test]
    fn missing_trigger_and_clock_regression() {
        let h = harness();
        assert_eq!(h.checker.check(TriggerId::new()).unwrap(), CheckReport::Missing);

        let t = Trigger::new("load", "a.*").with_thresholds(None, Some(1.0));
        h.store.save_trigger(t.clone()).unwrap();
        h.checker.check(t.id).unwrap();
        h.clock.set(9_000);
        assert_eq!(h.checker.check(t.id).unwrap(), CheckReport::OutOfOrder);
    }

    #[test]
    fn remote_trigger_without_evaluator_is_skipped() {
        let h = harness();
        let t = Trigger::new("r", "a.*").with_thresholds(None, Some(1.0)).remote();
        h.store.save_trigger(t.clone()).unwrap();
        assert_eq!(h.checker.check(t.id).unwrap(), CheckReport::NoEvaluator);
        assert!(!h.checker.has_remote());
    }

    #[test]
    fn invalid_target_becomes_exception() {
        let h = harness();
        let t = Trigger::new("bad", "a.{b").with_thresholds(None, Some(1.0));
        h.store.save_trigger(t.clone()).unwrap();
        let report = h.checker.check(t.id).unwrap();
        assert!(matches!(
            report,
            CheckReport::Checked {
                state: CheckState::Exception,
                events: 1,
                ..
            }
        ));
        assert_eq!(h.checker.metrics().checker.exceptions.get(), 1);
    }

    #[test]
    fn store_outage_records_nothing() {
        let h = harness();
        let t = Trigger::new("load", "a.*").with_thresholds(None, Some(1.0));
        h.store.save_trigger(t.clone()).unwrap();
        h.store.set_unavailable(true);
        assert!(h.checker.check(t.id).is_err());
        h.store.set_unavailable(false);
        assert!(h.store.get_check_data(t.id).unwrap().is_none());
    }

    #[test]
    fn old_points_are_pruned_and_quiet_trigger_goes_idle() {
        let h = harness();
        let t = Trigger::new("load", "a.*").with_thresholds(None, Some(100.0));
        h.store.save_trigger(t.clone()).unwrap();
        push(&h.store, "a.b", "a.*", 9_000, 1.0);
        push(&h.store, "a.b", "a.*", 9_990, 1.0);

        h.checker.check(t.id).unwrap();
        assert_eq!(h.store.get_metric_values("a.b", 0, 20_000).unwrap().len(), 1);

        h.clock.set(10_700);
        let report = h.checker.check(t.id).unwrap();
        assert_eq!(
            report,
            CheckReport::Checked {
                state: CheckState::Nodata,
                events: 1,
                idle: true
            }
        );
    }
}
