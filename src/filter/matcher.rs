//! Sample intake and the matching workers.
//!
//! [`MetricsMatcher::ingest`] never blocks: parsed samples go into a bounded
//! queue with `try_send` and are dropped (and counted) when it is full.
//! Workers drain the queue in batches, match each name against the current
//! [`PatternIndex`] snapshot and hand the result to the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{select, Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::error::{spawn_error, TripwireResult};
use crate::metric::{parse_line, MatchedMetric, Metric, ParseError};
use crate::metrics::PipelineMetrics;
use crate::shutdown::ShutdownSignal;
use crate::storage::{HeartbeatKind, HeartbeatStore, MetricStore, PatternStore, Store, TriggerStore};
use crate::time::SharedClock;

use super::index::PatternIndex;
use super::retention::Retentions;

/// Why a line was not accepted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The line does not follow the plaintext protocol.
    #[error("malformed line: {0}")]
    Malformed(#[from] ParseError),

    /// The intake queue is full; the sample was dropped.
    #[error("intake queue full, sample dropped")]
    Dropped,

    /// The pipeline is shutting down.
    #[error("intake closed")]
    Closed,
}

/// Cloneable intake handle.
#[derive(Debug, Clone)]
pub struct MetricsMatcher {
    tx: Sender<Metric>,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownSignal,
}

impl MetricsMatcher {
    pub(crate) fn new(
        tx: Sender<Metric>,
        metrics: Arc<PipelineMetrics>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            tx,
            metrics,
            shutdown,
        }
    }

    /// Parses one line and queues the sample.
    ///
    /// # Errors
    ///
    /// `Malformed` for a bad line, `Dropped` when the queue is full, `Closed`
    /// after shutdown. Each outcome is also counted.
    pub fn ingest(&self, line: &str) -> Result<(), IngestError> {
        self.metrics.filter.received.inc();
        let metric = parse_line(line).map_err(|e| {
            self.metrics.filter.malformed.inc();
            tracing::debug!(error = %e, line = line.trim_end(), "dropping malformed line");
            IngestError::from(e)
        })?;
        self.enqueue(metric)
    }

    /// Counts a record dropped by the listener for exceeding `limit` bytes.
    pub(crate) fn reject_oversized(&self, limit: usize) {
        self.metrics.filter.received.inc();
        self.metrics.filter.malformed.inc();
        tracing::debug!(limit, "dropping oversized record");
    }

    /// Queues an already parsed sample.
    ///
    /// # Errors
    ///
    /// Same as [`MetricsMatcher::ingest`] minus `Malformed`.
    pub fn ingest_metric(&self, metric: Metric) -> Result<(), IngestError> {
        self.enqueue(metric)
    }

    fn enqueue(&self, metric: Metric) -> Result<(), IngestError> {
        if self.shutdown.is_triggered() {
            return Err(IngestError::Closed);
        }
        match self.tx.try_send(metric) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.filter.dropped.inc();
                Err(IngestError::Dropped)
            }
            Err(TrySendError::Disconnected(_)) => Err(IngestError::Closed),
        }
    }
}

/// Everything a matching worker needs.
#[derive(Clone)]
pub(crate) struct MatchContext {
    pub index: Arc<ArcSwap<PatternIndex>>,
    pub retentions: Arc<Retentions>,
    pub store: Arc<dyn Store>,
    pub clock: SharedClock,
    pub metrics: Arc<PipelineMetrics>,
}

impl MatchContext {
    /// Matches a batch and records it. Store failures are logged and counted.
    pub(crate) fn process_batch(&self, batch: &[Metric]) {
        if batch.is_empty() {
            return;
        }
        let index = self.index.load();
        let mut matched = Vec::with_capacity(batch.len());
        for metric in batch {
            let patterns = index.match_name(&metric.name);
            if patterns.is_empty() {
                self.metrics.filter.unmatched.inc();
                continue;
            }
            self.metrics.filter.matched.inc();
            let step = self.retentions.step_for(&metric.name);
            matched.push(MatchedMetric {
                name: metric.name.clone(),
                value: metric.value,
                timestamp: metric.timestamp,
                retention_timestamp: Retentions::round(metric.timestamp, step),
                retention: step,
                patterns,
            });
        }
        if matched.is_empty() {
            return;
        }

        if let Err(e) = self.record(&matched) {
            self.metrics.filter.store_errors.inc();
            tracing::warn!(error = %e, samples = matched.len(), "failed to store matched batch");
        }
    }

    fn record(&self, matched: &[MatchedMetric]) -> TripwireResult<()> {
        self.store.save_metrics(matched)?;

        let patterns: BTreeSet<&str> = matched
            .iter()
            .flat_map(|m| m.patterns.iter().map(String::as_str))
            .collect();
        let mut triggers = BTreeSet::new();
        for pattern in patterns {
            triggers.extend(self.store.get_pattern_triggers(pattern)?);
        }
        let triggers: Vec<_> = triggers.into_iter().collect();
        self.store.add_triggers_to_check(&triggers)?;
        self.store
            .set_heartbeat(HeartbeatKind::MetricReceived, self.clock.now_unix())?;
        tracing::trace!(samples = matched.len(), triggers = triggers.len(), "stored batch");
        Ok(())
    }
}

/// Spawns `workers` matching threads sharing one queue.
pub(crate) fn spawn_workers(
    workers: usize,
    batch_size: usize,
    batch_timeout: Duration,
    rx: &Receiver<Metric>,
    ctx: &MatchContext,
    shutdown: &ShutdownSignal,
) -> TripwireResult<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(workers.max(1));
    for idx in 0..workers.max(1) {
        let rx = rx.clone();
        let ctx = ctx.clone();
        let stop = shutdown.receiver();
        let name = format!("tripwire-filter-{idx}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&rx, &stop, &ctx, batch_size.max(1), batch_timeout))
            .map_err(|e| spawn_error(&name, &e))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_loop(
    rx: &Receiver<Metric>,
    stop: &Receiver<()>,
    ctx: &MatchContext,
    batch_size: usize,
    batch_timeout: Duration,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut deadline = Instant::now() + batch_timeout;

    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        select! {
            recv(rx) -> msg => match msg {
                Ok(metric) => {
                    if batch.is_empty() {
                        deadline = Instant::now() + batch_timeout;
                    }
                    batch.push(metric);
                    if batch.len() >= batch_size || Instant::now() >= deadline {
                        ctx.process_batch(&batch);
                        batch.clear();
                    }
                }
                Err(_) => break,
            },
            recv(stop) -> _ => {
                batch.extend(rx.try_iter());
                break;
            }
            default(wait) => {
                ctx.process_batch(&batch);
                batch.clear();
                deadline = Instant::now() + batch_timeout;
            }
        }
    }

    for chunk in batch.chunks(batch_size) {
        ctx.process_batch(chunk);
    }
}
