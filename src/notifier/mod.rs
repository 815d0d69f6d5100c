//! Notification dispatch.
//!
//! [`Notifier`] collects initialized senders; [`Notifier::start`] spawns the
//! intake thread and one consumer per sender and returns a
//! [`RunningNotifier`]. Producers hold a [`NotifierHandle`], which accepts
//! events until shutdown starts.
//!
//! Shutdown closes intake first, so in-flight publishes either land in the
//! queue or fail with `ShuttingDown`. The intake thread then drains its queue,
//! releases every throttled package and closes the sender mailboxes; each
//! consumer finishes its queues and checks out of a `WaitGroup`.

mod dispatcher;
mod package;
mod retry;
mod throttle;
mod worker;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender as Tx};
use crossbeam_utils::sync::WaitGroup;

use crate::checker::EventSink;
use crate::config::{NotifierConfig, SenderSettings};
use crate::error::{spawn_error, ExecutionError, TripwireError, TripwireResult, ValidationError};
use crate::metrics::PipelineMetrics;
use crate::senders::{build_sender, Sender, SenderContext};
use crate::shutdown::ShutdownSignal;
use crate::storage::Store;
use crate::trigger::Event;

use dispatcher::Dispatcher;
use worker::{spawn_worker, WorkerSettings};

pub use package::NotificationPackage;
pub use retry::ResendPolicy;
pub use throttle::Throttler;

struct Registered {
    sender: Box<dyn Sender>,
    span: tracing::Span,
}

/// Notifier under construction.
pub struct Notifier {
    cfg: NotifierConfig,
    store: Arc<dyn Store>,
    metrics: Arc<PipelineMetrics>,
    senders: BTreeMap<String, Registered>,
}

impl Notifier {
    /// Creates a notifier with no senders.
    #[must_use]
    pub fn new(cfg: NotifierConfig, store: Arc<dyn Store>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            cfg,
            store,
            metrics,
            senders: BTreeMap::new(),
        }
    }

    /// Builds and initializes the configured senders.
    ///
    /// A sender whose `init` fails is logged and left out; the others are
    /// still registered.
    ///
    /// # Errors
    ///
    /// `ValidationError` for an empty name or type, an unknown type or a
    /// duplicate name.
    pub fn register_senders(&mut self, settings: &[SenderSettings]) -> TripwireResult<()> {
        for s in settings {
            if s.name.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "notifier.senders.name".to_string(),
                }
                .into());
            }
            if s.kind.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: format!("notifier.senders[{}].type", s.name),
                }
                .into());
            }
            let sender = build_sender(&s.kind).ok_or_else(|| ValidationError::UnknownSenderType {
                name: s.name.clone(),
                kind: s.kind.clone(),
            })?;
            match self.register(&s.name, &s.kind, s.options.clone(), sender) {
                Ok(()) => {}
                Err(TripwireError::Sender(e)) => {
                    tracing::error!(sender = %s.name, kind = %s.kind, error = %e, "sender init failed, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Registers an embedder-provided sender under `name`; contacts whose
    /// type equals `name` are delivered through it.
    ///
    /// # Errors
    ///
    /// `ValidationError::DuplicateSender` if the name is taken, or the
    /// sender's own `init` error.
    pub fn register_sender(&mut self, name: &str, sender: Box<dyn Sender>) -> TripwireResult<()> {
        self.register(name, "custom", BTreeMap::new(), sender)
    }

    fn register(
        &mut self,
        name: &str,
        kind: &str,
        options: BTreeMap<String, serde_json::Value>,
        mut sender: Box<dyn Sender>,
    ) -> TripwireResult<()> {
        if self.senders.contains_key(name) {
            return Err(ValidationError::DuplicateSender {
                name: name.to_string(),
            }
            .into());
        }
        let span = tracing::info_span!("sender", name = %name, kind = %kind);
        let ctx = SenderContext {
            name: name.to_string(),
            kind: kind.to_string(),
            front_uri: self.cfg.front_uri.clone(),
            options,
            timeout: self.cfg.sender_timeout,
            span: span.clone(),
        };
        sender.init(&ctx)?;
        tracing::info!(sender = %name, kind = %kind, "sender registered");
        self.senders.insert(name.to_string(), Registered { sender, span });
        Ok(())
    }

    /// Names of the registered senders.
    #[must_use]
    pub fn sender_names(&self) -> Vec<String> {
        self.senders.keys().cloned().collect()
    }

    /// Spawns the sender consumers and the intake thread.
    ///
    /// # Errors
    ///
    /// Thread spawn failures.
    pub fn start(self) -> TripwireResult<RunningNotifier> {
        let cfg = self.cfg;
        let settings = WorkerSettings {
            sender_timeout: cfg.sender_timeout,
            policy: ResendPolicy::from_config(&cfg),
            shutdown_timeout: cfg.shutdown_timeout,
        };

        let wg = WaitGroup::new();
        let mut mailboxes = BTreeMap::new();
        for (name, registered) in self.senders {
            let (tx, rx) = bounded::<NotificationPackage>(cfg.mailbox_capacity.max(1));
            spawn_worker(
                &name,
                registered.sender,
                registered.span,
                rx,
                settings,
                &self.metrics,
                wg.clone(),
            )?;
            mailboxes.insert(name, tx);
        }

        let sender_count = mailboxes.len();
        let (events_tx, events_rx) = bounded::<Event>(cfg.event_queue_capacity.max(1));
        let (direct_tx, direct_rx) = bounded::<NotificationPackage>(cfg.event_queue_capacity.max(1));
        let stop = ShutdownSignal::new();
        let dispatcher = Dispatcher {
            store: self.store,
            metrics: Arc::clone(&self.metrics),
            mailboxes,
            throttler: Throttler::new(cfg.sender_timeout),
        };
        let flush_every = (cfg.sender_timeout / 10).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let stop_rx = stop.receiver();
        let name = "tripwire-notifier";
        let intake = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dispatcher.run(&events_rx, &direct_rx, &stop_rx, flush_every))
            .map_err(|e| spawn_error(name, &e))?;

        tracing::info!(senders = sender_count, "notifier started");
        Ok(RunningNotifier {
            handle: NotifierHandle {
                inner: Arc::new(HandleInner {
                    open: RwLock::new(true),
                    events: events_tx,
                    direct: direct_tx,
                    timeout: cfg.sender_timeout,
                }),
            },
            intake,
            stop,
            wg,
            shutdown_timeout: cfg.shutdown_timeout,
        })
    }
}

struct HandleInner {
    open: RwLock<bool>,
    events: Tx<Event>,
    direct: Tx<NotificationPackage>,
    timeout: Duration,
}

/// Producer side of a running notifier.
#[derive(Clone)]
pub struct NotifierHandle {
    inner: Arc<HandleInner>,
}

impl NotifierHandle {
    fn submit<T>(&self, tx: &Tx<T>, item: T, path: &str) -> TripwireResult<()> {
        let open = self
            .inner
            .open
            .read()
            .map_err(|_| TripwireError::internal("notifier gate poisoned"))?;
        if !*open {
            return Err(ExecutionError::ShuttingDown {
                component: "notifier".to_string(),
            }
            .into());
        }
        match tx.send_timeout(item, self.inner.timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(ExecutionError::QueueFull {
                path: path.to_string(),
                capacity: tx.capacity().unwrap_or_default(),
            }
            .into()),
            Err(SendTimeoutError::Disconnected(_)) => Err(ExecutionError::Disconnected {
                path: path.to_string(),
            }
            .into()),
        }
    }

    /// Queues a package for delivery as is, bypassing subscriptions and
    /// throttling.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once shutdown started, `QueueFull` if the intake queue
    /// stays full for the sender timeout.
    pub fn send_direct(&self, package: NotificationPackage) -> TripwireResult<()> {
        self.submit(&self.inner.direct, package, "notifier.direct")
    }

    fn close(&self) {
        match self.inner.open.write() {
            Ok(mut open) => *open = false,
            Err(poisoned) => *poisoned.into_inner() = false,
        }
    }
}

impl EventSink for NotifierHandle {
    fn publish(&self, event: Event) -> TripwireResult<()> {
        self.submit(&self.inner.events, event, "notifier.events")
    }
}

/// A started notifier.
pub struct RunningNotifier {
    handle: NotifierHandle,
    intake: JoinHandle<()>,
    stop: ShutdownSignal,
    wg: WaitGroup,
    shutdown_timeout: Duration,
}

impl RunningNotifier {
    /// A new producer handle.
    #[must_use]
    pub fn handle(&self) -> NotifierHandle {
        self.handle.clone()
    }

    /// Stops intake, flushes everything queued and waits for the senders.
    ///
    /// # Errors
    ///
    /// `ExecutionError::Timeout` if the senders did not drain within the
    /// shutdown timeout.
    pub fn shutdown(self) -> TripwireResult<()> {
        self.handle.close();
        self.stop.trigger();
        if self.intake.join().is_err() {
            tracing::error!("notifier intake panicked");
        }

        let (done_tx, done_rx): (Tx<()>, Receiver<()>) = bounded(1);
        let wg = self.wg;
        let waiter = thread::Builder::new()
            .name("tripwire-notifier-drain".to_string())
            .spawn(move || {
                wg.wait();
                let _ = done_tx.send(());
            })
            .map_err(|e| spawn_error("tripwire-notifier-drain", &e))?;

        // Allow for the consumer's own drain deadline plus one attempt.
        if done_rx.recv_timeout(self.shutdown_timeout + self.handle.inner.timeout).is_err() {
            tracing::error!("notifier senders did not drain in time");
            return Err(ExecutionError::Timeout {
                duration_ms: u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into());
        }
        let _ = waiter.join();
        tracing::info!("notifier stopped");
        Ok(())
    }
}
