//! Ingestion and pattern matching.
//!
//! Lines come in through [`MetricsMatcher::ingest`] (directly or via the
//! [`MetricsListener`]), are matched against the current [`PatternIndex`]
//! snapshot by a small worker pool, and the matched samples are appended to
//! the store together with the triggers they concern.

mod index;
mod listener;
mod matcher;
mod refresher;
mod retention;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use arc_swap::ArcSwap;
use crossbeam_channel::bounded;

use crate::config::FilterConfig;
use crate::error::TripwireResult;
use crate::metrics::PipelineMetrics;
use crate::shutdown::ShutdownSignal;
use crate::storage::Store;
use crate::time::SharedClock;

pub use index::PatternIndex;
pub use listener::MetricsListener;
pub use matcher::{IngestError, MetricsMatcher};
pub use refresher::PatternRefresher;
pub use retention::Retentions;

use matcher::MatchContext;

/// The running ingestion stage.
#[derive(Debug)]
pub struct Filter {
    matcher: MetricsMatcher,
    workers: Vec<JoinHandle<()>>,
    refresher: JoinHandle<()>,
    listener: Option<MetricsListener>,
}

impl Filter {
    /// Loads the initial pattern index and starts the workers, the refresher
    /// and, when `cfg.listen` is set, the TCP listener.
    ///
    /// # Errors
    ///
    /// Invalid retention rules, bind failures and spawn failures. A store
    /// failure while loading the first index is logged; the refresher retries.
    pub fn start(
        cfg: &FilterConfig,
        store: Arc<dyn Store>,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
        shutdown: &ShutdownSignal,
    ) -> TripwireResult<Self> {
        let retentions = Arc::new(Retentions::new(&cfg.retentions, cfg.default_retention)?);
        let index = Arc::new(ArcSwap::from_pointee(PatternIndex::empty()));

        let refresher = PatternRefresher::new(Arc::clone(&store), Arc::clone(&index));
        if let Err(e) = refresher.refresh() {
            tracing::warn!(error = %e, "initial pattern load failed");
        }
        let refresher = refresher.spawn(cfg.pattern_refresh_interval, shutdown.clone())?;

        let (tx, rx) = bounded(cfg.queue_capacity.max(1));
        let matcher = MetricsMatcher::new(tx, Arc::clone(&metrics), shutdown.clone());
        let ctx = MatchContext {
            index,
            retentions,
            store,
            clock,
            metrics,
        };
        let workers = matcher::spawn_workers(
            cfg.workers,
            cfg.batch_size,
            cfg.batch_timeout,
            &rx,
            &ctx,
            shutdown,
        )?;

        let listener = if cfg.listen.trim().is_empty() {
            None
        } else {
            Some(MetricsListener::bind(
                cfg.listen.trim(),
                matcher.clone(),
                shutdown.clone(),
            )?)
        };

        tracing::info!(workers = workers.len(), "filter started");
        Ok(Self {
            matcher,
            workers,
            refresher,
            listener,
        })
    }

    /// An intake handle.
    #[must_use]
    pub fn matcher(&self) -> MetricsMatcher {
        self.matcher.clone()
    }

    /// Address of the TCP listener, if one was started.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(MetricsListener::local_addr)
    }

    /// Waits for every thread after the shutdown signal fired. Workers drain
    /// the intake queue before exiting.
    pub fn join(self) {
        if let Some(listener) = self.listener {
            listener.join();
        }
        for handle in self.workers {
            if handle.join().is_err() {
                tracing::error!("filter worker panicked");
            }
        }
        if self.refresher.join().is_err() {
            tracing::error!("pattern refresher panicked");
        }
    }
}
