//! Cooperative shutdown signal shared by every long-running loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

#[derive(Debug)]
struct Inner {
    fired: AtomicBool,
    // Dropped on trigger; every receiver then observes disconnection.
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// A one-shot broadcast flag.
///
/// Loops either poll [`ShutdownSignal::is_triggered`] or add
/// [`ShutdownSignal::receiver`] to a `select!`, where the receiver becomes
/// ready (disconnected) once the signal fires.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn trigger(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        let sender = match self.inner.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// A receiver that disconnects when the signal fires. Never yields a message.
    #[must_use]
    pub fn receiver(&self) -> Receiver<()> {
        self.inner.rx.clone()
    }

    /// Sleeps up to `timeout`, waking early on shutdown. Returns true if fired.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) | Ok(()) => self.is_triggered(),
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
