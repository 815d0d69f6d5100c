//! Wiring of the whole pipeline.
//!
//! Stages start downstream first (notifier, then checker, then filter and
//! self-state) so that nothing produced upstream is ever without a consumer,
//! and stop in the opposite order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::checker::{CheckScheduler, PatternEvaluator, TargetEvaluator, TriggerChecker};
use crate::config::Config;
use crate::error::{TripwireError, TripwireResult};
use crate::filter::{Filter, MetricsMatcher};
use crate::metrics::PipelineMetrics;
use crate::notifier::{Notifier, NotifierHandle, RunningNotifier};
use crate::selfstate::SelfStateMonitor;
use crate::senders::Sender;
use crate::shutdown::ShutdownSignal;
use crate::storage::Store;
use crate::time::{system_clock, SharedClock};

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

/// Collects everything a [`Pipeline`] needs before it starts.
pub struct PipelineBuilder {
    config: Config,
    store: Arc<dyn Store>,
    clock: SharedClock,
    remote: Option<Arc<dyn TargetEvaluator>>,
    senders: Vec<(String, Box<dyn Sender>)>,
    shutdown: ShutdownSignal,
}

impl PipelineBuilder {
    /// Starts a builder over `store` with the system clock.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            clock: system_clock(),
            remote: None,
            senders: Vec::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Enables evaluation of remote triggers.
    #[must_use]
    pub fn remote_evaluator(mut self, evaluator: Arc<dyn TargetEvaluator>) -> Self {
        self.remote = Some(evaluator);
        self
    }

    /// Adds an embedder-provided sender, serving contacts of type `name`.
    #[must_use]
    pub fn sender(mut self, name: impl Into<String>, sender: Box<dyn Sender>) -> Self {
        self.senders.push((name.into(), sender));
        self
    }

    /// Uses an externally owned shutdown signal, e.g. one fired by a signal
    /// handler.
    #[must_use]
    pub fn shutdown_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Validates the configuration and starts every stage.
    ///
    /// # Errors
    ///
    /// Configuration and sender registration errors, listener bind failures
    /// and thread spawn failures. Stages already started are stopped again.
    pub fn start(self) -> TripwireResult<Pipeline> {
        let Self {
            config,
            store,
            clock,
            remote,
            senders,
            shutdown,
        } = self;
        config.validate()?;
        let metrics = PipelineMetrics::new();

        let mut notifier = Notifier::new(config.notifier.clone(), Arc::clone(&store), Arc::clone(&metrics));
        notifier.register_senders(&config.notifier.senders)?;
        for (name, sender) in senders {
            match notifier.register_sender(&name, sender) {
                Ok(()) => {}
                Err(TripwireError::Sender(e)) => {
                    tracing::error!(sender = %name, error = %e, "sender init failed, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        let registered = notifier.sender_names();
        for contact in &config.self_state.contacts {
            if !registered.contains(&contact.kind) {
                tracing::warn!(contact = %contact.value, kind = %contact.kind, "self-state contact has no sender");
            }
        }
        let notifier = notifier.start()?;

        let checker = TriggerChecker::new(
            Arc::clone(&store),
            Arc::new(PatternEvaluator::new(Arc::clone(&store))),
            remote,
            Arc::new(notifier.handle()),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            secs(config.checker.metrics_ttl),
            secs(config.checker.stop_checking_interval),
        );
        let scheduler = match CheckScheduler::start(&config.checker, checker, &shutdown) {
            Ok(s) => s,
            Err(e) => {
                abort(&shutdown, None, None, notifier);
                return Err(e);
            }
        };

        let filter = match Filter::start(
            &config.filter,
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&metrics),
            &shutdown,
        ) {
            Ok(f) => f,
            Err(e) => {
                abort(&shutdown, None, Some(scheduler), notifier);
                return Err(e);
            }
        };

        let self_state = if config.self_state.enabled {
            let monitor = SelfStateMonitor::new(
                config.self_state.clone(),
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&metrics),
            )
            .with_notifier(notifier.handle());
            match monitor.spawn(&shutdown) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    abort(&shutdown, Some(filter), Some(scheduler), notifier);
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::info!(
            listen = ?filter.listen_addr(),
            self_state = config.self_state.enabled,
            "pipeline started"
        );
        Ok(Pipeline {
            filter,
            scheduler,
            self_state,
            notifier,
            shutdown,
            metrics,
        })
    }
}

fn abort(
    shutdown: &ShutdownSignal,
    filter: Option<Filter>,
    scheduler: Option<CheckScheduler>,
    notifier: RunningNotifier,
) {
    shutdown.trigger();
    if let Some(filter) = filter {
        filter.join();
    }
    if let Some(scheduler) = scheduler {
        scheduler.join();
    }
    if let Err(e) = notifier.shutdown() {
        tracing::warn!(error = %e, "notifier shutdown after failed start");
    }
}

/// A running pipeline.
pub struct Pipeline {
    filter: Filter,
    scheduler: CheckScheduler,
    self_state: Option<JoinHandle<()>>,
    notifier: RunningNotifier,
    shutdown: ShutdownSignal,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    /// In-process ingestion handle.
    #[must_use]
    pub fn matcher(&self) -> MetricsMatcher {
        self.filter.matcher()
    }

    /// Shared counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Address of the TCP listener, if enabled.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.filter.listen_addr()
    }

    /// Direct access to the notifier intake.
    #[must_use]
    pub fn notifier(&self) -> NotifierHandle {
        self.notifier.handle()
    }

    /// The signal that stops the upstream stages.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Stops ingestion, checking and self-state, then drains the notifier.
    ///
    /// # Errors
    ///
    /// `ExecutionError::Timeout` if senders did not drain in time.
    pub fn shutdown(self) -> TripwireResult<()> {
        tracing::info!("pipeline shutting down");
        self.shutdown.trigger();
        self.filter.join();
        self.scheduler.join();
        if let Some(handle) = self.self_state {
            if handle.join().is_err() {
                tracing::error!("self-state monitor panicked");
            }
        }
        self.notifier.shutdown()
    }
}
