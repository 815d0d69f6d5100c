//! Target evaluation.
//!
//! A [`TargetEvaluator`] turns a trigger target into named time series over a
//! time window. [`PatternEvaluator`] reads series straight from the store,
//! treating the target as a glob pattern; remote evaluators are supplied by
//! the embedder.

use std::sync::Arc;

use thiserror::Error;

use crate::metric::MetricValue;
use crate::pattern::GlobPattern;
use crate::storage::{MetricStore, StorageError, Store};
use crate::trigger::Trigger;

/// Errors produced while evaluating a target.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    /// The target cannot be evaluated as written.
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget {
        target: String,
        reason: String,
    },

    /// The evaluator failed while computing the result.
    #[error("evaluation of '{target}' failed: {reason}")]
    Failed {
        target: String,
        reason: String,
    },

    /// The data source could not be reached. The check is retried on the
    /// next cycle instead of being recorded as an exception.
    #[error("data source unavailable: {0}")]
    Unavailable(String),
}

impl EvaluationError {
    /// Returns true if the failure says nothing about the trigger itself.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<StorageError> for EvaluationError {
    fn from(e: StorageError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// A named series of points in ascending time order.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub name: String,
    pub values: Vec<MetricValue>,
}

impl TimeSeries {
    /// Creates a series from `(timestamp, value)` pairs.
    #[must_use]
    pub fn from_points(name: impl Into<String>, points: &[(i64, f64)]) -> Self {
        Self {
            name: name.into(),
            values: points
                .iter()
                .map(|&(timestamp, value)| MetricValue { timestamp, value })
                .collect(),
        }
    }

    /// Timestamp of the newest point.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<i64> {
        self.values.iter().map(|v| v.timestamp).max()
    }
}

/// Computes the series a trigger target refers to.
pub trait TargetEvaluator: Send + Sync {
    /// Evaluates `target` over `[from, until]`.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the backing data cannot be read, anything else when
    /// the target itself cannot be evaluated.
    fn evaluate(
        &self,
        trigger: &Trigger,
        target: &str,
        from: i64,
        until: i64,
    ) -> Result<Vec<TimeSeries>, EvaluationError>;
}

/// Local evaluator: every metric name that matched the target pattern.
#[derive(Clone)]
pub struct PatternEvaluator {
    store: Arc<dyn Store>,
}

impl PatternEvaluator {
    /// Creates an evaluator over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl TargetEvaluator for PatternEvaluator {
    fn evaluate(
        &self,
        _trigger: &Trigger,
        target: &str,
        from: i64,
        until: i64,
    ) -> Result<Vec<TimeSeries>, EvaluationError> {
        GlobPattern::parse(target).map_err(|e| EvaluationError::InvalidTarget {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

        let names = self.store.get_pattern_metrics(target)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let values = self.store.get_metric_values(&name, from, until)?;
            out.push(TimeSeries { name, values });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::metric::MatchedMetric;
    use crate::storage::InMemoryStore;

    #[test]
    fn reads_every_matched_series() {
        let store = Arc::new(InMemoryStore::new());
        let sample = |name: &str, ts: i64| MatchedMetric {
            name: name.to_string(),
            value: 1.0,
            timestamp: ts,
            retention_timestamp: ts,
            retention: 60,
            patterns: vec!["a.*".to_string()],
        };
        store
            .save_metrics(&[sample("a.x", 60), sample("a.y", 120), sample("a.y", 180)])
            .unwrap();

        let eval = PatternEvaluator::new(store);
        let trigger = Trigger::new("t", "a.*");
        let series = eval.evaluate(&trigger, "a.*", 100, 200).unwrap();
        assert_eq!(series.len(), 2);
        let y = series.iter().find(|s| s.name == "a.y").unwrap();
        assert_eq!(y.values.len(), 2);
        assert_eq!(y.last_timestamp(), Some(180));
        assert!(series.iter().find(|s| s.name == "a.x").unwrap().values.is_empty());
    }

    #[test]
    fn bad_target_and_outage_are_distinguished() {
        let store = Arc::new(InMemoryStore::new());
        let eval = PatternEvaluator::new(Arc::clone(&store) as Arc<dyn Store>);
        let trigger = Trigger::new("t", "a.{b");
        let err = eval.evaluate(&trigger, "a.{b", 0, 10).unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidTarget { .. }));

        store.set_unavailable(true);
        let err = eval.evaluate(&trigger, "a.*", 0, 10).unwrap_err();
        assert!(err.is_unavailable());
    }
}
