//! Trigger state machine.
//!
//! Pure functions from (trigger, recorded state, fresh series, now) to the
//! next recorded state plus the events describing every transition.

use std::collections::BTreeSet;

use crate::trigger::{CheckData, CheckState, Event, MetricState, Trigger};

use super::evaluator::TimeSeries;

/// Next recorded state and the events that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State to persist.
    pub data: CheckData,
    /// Events in emission order.
    pub events: Vec<Event>,
}

/// Classifies a single value against the trigger thresholds.
///
/// With both thresholds set and `warn < error` the rule is rising; with
/// `warn >= error` it is falling. A single threshold is always rising.
///
/// # Examples
///
/// ```
/// use tripwire::checker::classify;
/// use tripwire::{CheckState, Trigger};
///
/// let rising = Trigger::new("t", "a.b").with_thresholds(Some(50.0), Some(75.0));
/// assert_eq!(classify(&rising, 60.0), CheckState::Warn);
///
/// let falling = Trigger::new("t", "a.b").with_thresholds(Some(20.0), Some(10.0));
/// assert_eq!(classify(&falling, 5.0), CheckState::Error);
/// assert_eq!(classify(&falling, 15.0), CheckState::Warn);
/// assert_eq!(classify(&falling, 25.0), CheckState::Ok);
/// ```
#[must_use]
pub fn classify(trigger: &Trigger, value: f64) -> CheckState {
    match (trigger.warn_value, trigger.error_value) {
        (Some(warn), Some(error)) if warn >= error => {
            if value <= error {
                CheckState::Error
            } else if value <= warn {
                CheckState::Warn
            } else {
                CheckState::Ok
            }
        }
        (warn, error) => {
            if error.is_some_and(|e| value >= e) {
                CheckState::Error
            } else if warn.is_some_and(|w| value >= w) {
                CheckState::Warn
            } else {
                CheckState::Ok
            }
        }
    }
}

/// Applies freshly evaluated series.
///
/// Points newer than each metric's last processed point and not older than
/// `now - ttl` are classified in time order. A metric whose newest point is
/// older than `now - ttl`, or that is no longer returned at all, falls into
/// the trigger's `ttl_state`. With no series at all the whole trigger takes
/// `ttl_state`.
#[must_use]
pub fn apply_series(
    trigger: &Trigger,
    previous: &CheckData,
    series: &[TimeSeries],
    now: i64,
    ttl: i64,
) -> Transition {
    let cutoff = now - ttl;
    let mut data = previous.clone();
    data.timestamp = now;
    data.message = None;
    let mut events = Vec::new();

    if series.is_empty() {
        for metric in data.metrics.values_mut() {
            metric.state = trigger.ttl_state;
        }
        data.state = trigger.ttl_state;
        if previous.state != trigger.ttl_state {
            events.push(
                Event::transition(trigger.id, &trigger.name, previous.state, trigger.ttl_state, now)
                    .with_message("no metrics returned"),
            );
        }
        return finish(data, events);
    }

    // A metric seen for the first time starts from NODATA only if the whole
    // trigger is currently NODATA.
    let first_state = if previous.state == CheckState::Nodata {
        CheckState::Nodata
    } else {
        CheckState::Ok
    };

    let mut seen = BTreeSet::new();
    for s in series {
        seen.insert(s.name.as_str());
        let recorded = data.metrics.get(&s.name).copied();
        let mut current = recorded.unwrap_or(MetricState {
            state: first_state,
            timestamp: 0,
            value: None,
        });

        let mut points: Vec<_> = s
            .values
            .iter()
            .filter(|p| p.timestamp > current.timestamp && p.timestamp >= cutoff)
            .collect();
        points.sort_by_key(|p| p.timestamp);

        for point in points {
            let next = classify(trigger, point.value);
            if next != current.state {
                events.push(
                    Event::transition(trigger.id, &s.name, current.state, next, point.timestamp)
                        .with_value(Some(point.value)),
                );
                current.state = next;
            }
            current.timestamp = point.timestamp;
            current.value = Some(point.value);
        }

        if current.timestamp < cutoff && current.state != trigger.ttl_state {
            events.push(Event::transition(
                trigger.id,
                &s.name,
                current.state,
                trigger.ttl_state,
                now,
            ));
            current.state = trigger.ttl_state;
        }
        data.metrics.insert(s.name.clone(), current);
    }

    for (name, metric) in &mut data.metrics {
        if seen.contains(name.as_str()) || metric.state == trigger.ttl_state {
            continue;
        }
        events.push(Event::transition(
            trigger.id,
            name,
            metric.state,
            trigger.ttl_state,
            now,
        ));
        metric.state = trigger.ttl_state;
    }

    data.state = CheckState::worst_of(data.metrics.values().map(|m| m.state));
    if previous.state == CheckState::Exception && data.state != CheckState::Exception {
        events.push(
            Event::transition(trigger.id, &trigger.name, CheckState::Exception, data.state, now)
                .with_message("evaluation recovered"),
        );
    }
    finish(data, events)
}

/// Records a failed evaluation as `EXCEPTION`.
///
/// Metric states are kept so that the recovery picks up where it left off.
#[must_use]
pub fn apply_failure(trigger: &Trigger, previous: &CheckData, message: &str, now: i64) -> Transition {
    let mut data = previous.clone();
    data.timestamp = now;
    data.state = CheckState::Exception;
    data.message = Some(message.to_string());

    let mut events = Vec::new();
    if previous.state != CheckState::Exception {
        events.push(
            Event::transition(trigger.id, &trigger.name, previous.state, CheckState::Exception, now)
                .with_message(message),
        );
    }
    finish(data, events)
}

fn finish(mut data: CheckData, events: Vec<Event>) -> Transition {
    if let Some(ts) = events.iter().map(|e| e.timestamp).max() {
        data.event_timestamp = data.event_timestamp.max(ts);
    }
    Transition { data, events }
}
