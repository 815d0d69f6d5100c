//! Check scheduling.
//!
//! A ticker thread turns three periodic sources into trigger ids:
//! the store's fresh-data set every `check_interval`, every local trigger
//! (minus idle ones) every `nodata_check_interval`, and every remote trigger
//! every `remote.check_interval` when a remote evaluator is available. Ids go
//! through one bounded queue, deduplicated by a pending set, to a fixed pool
//! of workers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender, TrySendError};

use crate::config::CheckerConfig;
use crate::error::{spawn_error, TripwireResult};
use crate::shutdown::ShutdownSignal;
use crate::storage::{CheckStore, TriggerStore};
use crate::trigger::TriggerId;

use super::check::{CheckReport, TriggerChecker};
use super::lock::LockArena;

#[derive(Debug, Default)]
struct Queues {
    pending: HashSet<TriggerId>,
    idle: HashSet<TriggerId>,
}

/// Queue side shared by the ticker and the workers.
struct Dispatch {
    tx: Sender<TriggerId>,
    state: Mutex<Queues>,
}

impl Dispatch {
    fn enqueue(&self, checker: &TriggerChecker, ids: impl IntoIterator<Item = TriggerId>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for id in ids {
            if !state.pending.insert(id) {
                continue;
            }
            match self.tx.try_send(id) {
                Ok(()) => {}
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                    state.pending.remove(&id);
                    checker.metrics().checker.queue_full.inc();
                }
            }
        }
    }

    fn take(&self, id: TriggerId) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(&id);
        }
    }

    fn wake(&self, ids: &[TriggerId]) {
        if let Ok(mut state) = self.state.lock() {
            for id in ids {
                state.idle.remove(id);
            }
        }
    }

    fn set_idle(&self, id: TriggerId, idle: bool) {
        if let Ok(mut state) = self.state.lock() {
            if idle {
                state.idle.insert(id);
            } else {
                state.idle.remove(&id);
            }
        }
    }

    fn active(&self, ids: Vec<TriggerId>) -> Vec<TriggerId> {
        match self.state.lock() {
            Ok(state) => ids.into_iter().filter(|id| !state.idle.contains(id)).collect(),
            Err(_) => ids,
        }
    }
}

/// The running check scheduler.
#[derive(Debug)]
pub struct CheckScheduler {
    ticker: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl CheckScheduler {
    /// Starts the ticker and `cfg.workers()` check workers.
    ///
    /// # Errors
    ///
    /// Thread spawn failures.
    pub fn start(
        cfg: &CheckerConfig,
        checker: TriggerChecker,
        shutdown: &ShutdownSignal,
    ) -> TripwireResult<Self> {
        let workers = cfg.workers();
        let (tx, rx) = bounded::<TriggerId>(cfg.queue_capacity.max(1));
        let dispatch = Arc::new(Dispatch {
            tx,
            state: Mutex::new(Queues::default()),
        });
        let checker = Arc::new(checker);
        let arena = Arc::new(LockArena::new(workers));

        let mut handles = Vec::with_capacity(workers);
        for slot in 0..workers {
            let worker = Worker {
                slot,
                rx: rx.clone(),
                stop: shutdown.receiver(),
                checker: Arc::clone(&checker),
                dispatch: Arc::clone(&dispatch),
                arena: Arc::clone(&arena),
                lock_ttl: cfg.lock_ttl,
            };
            let name = format!("tripwire-checker-{slot}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
                .map_err(|e| spawn_error(&name, &e))?;
            handles.push(handle);
        }

        let remote_enabled = cfg.remote.enabled && checker.has_remote();
        if cfg.remote.enabled && !remote_enabled {
            tracing::warn!("remote checks enabled but no remote evaluator configured");
        }
        let ticker = Ticker {
            cfg: cfg.clone(),
            remote_enabled,
            stop: shutdown.receiver(),
            checker,
            dispatch,
        };
        let name = "tripwire-check-ticker";
        let ticker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || ticker.run())
            .map_err(|e| spawn_error(name, &e))?;

        tracing::info!(workers, "check scheduler started");
        Ok(Self {
            ticker,
            workers: handles,
        })
    }

    /// Waits for the ticker and the workers to exit after shutdown.
    pub fn join(self) {
        if self.ticker.join().is_err() {
            tracing::error!("check ticker panicked");
        }
        for handle in self.workers {
            if handle.join().is_err() {
                tracing::error!("check worker panicked");
            }
        }
    }
}

struct Ticker {
    cfg: CheckerConfig,
    remote_enabled: bool,
    stop: Receiver<()>,
    checker: Arc<TriggerChecker>,
    dispatch: Arc<Dispatch>,
}

impl Ticker {
    fn run(self) {
        let fresh = tick(self.cfg.check_interval);
        let nodata = tick(self.cfg.nodata_check_interval);
        let remote = if self.remote_enabled {
            tick(self.cfg.remote.check_interval)
        } else {
            never()
        };
        let store = self.checker.store();

        loop {
            select! {
                recv(fresh) -> _ => match store.take_triggers_to_check() {
                    Ok(ids) => {
                        self.dispatch.wake(&ids);
                        self.dispatch.enqueue(&self.checker, ids);
                    }
                    Err(e) => self.store_error("take_triggers_to_check", &e),
                },
                recv(nodata) -> _ => match store.get_local_trigger_ids() {
                    Ok(ids) => {
                        let total = ids.len();
                        let active = self.dispatch.active(ids);
                        self.checker
                            .metrics()
                            .checker
                            .skipped_idle
                            .add((total - active.len()) as u64);
                        self.dispatch.enqueue(&self.checker, active);
                    }
                    Err(e) => self.store_error("get_local_trigger_ids", &e),
                },
                recv(remote) -> _ => match store.get_remote_trigger_ids() {
                    Ok(ids) => self.dispatch.enqueue(&self.checker, ids),
                    Err(e) => self.store_error("get_remote_trigger_ids", &e),
                },
                recv(self.stop) -> _ => break,
            }
        }
        tracing::debug!("check ticker stopped");
    }

    fn store_error(&self, op: &str, e: &dyn std::fmt::Display) {
        self.checker.metrics().checker.store_errors.inc();
        tracing::warn!(op, error = %e, "check scheduling read failed");
    }
}

struct Worker {
    slot: usize,
    rx: Receiver<TriggerId>,
    stop: Receiver<()>,
    checker: Arc<TriggerChecker>,
    dispatch: Arc<Dispatch>,
    arena: Arc<LockArena>,
    lock_ttl: std::time::Duration,
}

impl Worker {
    fn run(self) {
        loop {
            select! {
                recv(self.rx) -> msg => match msg {
                    Ok(id) => {
                        self.dispatch.take(id);
                        self.run_one(id);
                    }
                    Err(_) => break,
                },
                recv(self.stop) -> _ => break,
            }
        }
    }

    fn run_one(&self, id: TriggerId) {
        let metrics = self.checker.metrics();
        let Some(_slot) = self.arena.try_acquire(self.slot, id) else {
            metrics.checker.skipped_locked.inc();
            return;
        };
        let store = self.checker.store();
        match store.acquire_check_lock(id, self.lock_ttl) {
            Ok(true) => {}
            Ok(false) => {
                metrics.checker.skipped_locked.inc();
                return;
            }
            Err(e) => {
                metrics.checker.store_errors.inc();
                tracing::warn!(trigger_id = %id, error = %e, "failed to take check lock");
                return;
            }
        }

        match self.checker.check(id) {
            Ok(CheckReport::Checked { idle, .. }) => self.dispatch.set_idle(id, idle),
            Ok(CheckReport::Missing) => self.dispatch.set_idle(id, false),
            Ok(report) => tracing::debug!(trigger_id = %id, ?report, "check skipped"),
            Err(e) => {
                metrics.checker.store_errors.inc();
                tracing::warn!(trigger_id = %id, error = %e, "check failed");
            }
        }

        if let Err(e) = store.release_check_lock(id) {
            tracing::warn!(trigger_id = %id, error = %e, "failed to release check lock");
        }
    }
}
