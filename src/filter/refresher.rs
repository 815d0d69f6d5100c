//! Periodic pattern index rebuild.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::error::{spawn_error, TripwireResult};
use crate::shutdown::ShutdownSignal;
use crate::storage::{PatternStore, StorageError, Store};

use super::index::PatternIndex;

/// Rebuilds the [`PatternIndex`] from the store and swaps it in whole.
#[derive(Clone)]
pub struct PatternRefresher {
    store: Arc<dyn Store>,
    index: Arc<ArcSwap<PatternIndex>>,
}

impl PatternRefresher {
    /// Creates a refresher publishing into `index`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, index: Arc<ArcSwap<PatternIndex>>) -> Self {
        Self { store, index }
    }

    /// Reloads patterns once. Returns the number of indexed patterns.
    ///
    /// On a store error the previous snapshot stays in place.
    ///
    /// # Errors
    ///
    /// Propagates the store error.
    pub fn refresh(&self) -> Result<usize, StorageError> {
        let patterns = self.store.get_patterns()?;
        let (index, rejected) = PatternIndex::build(&patterns);
        for err in rejected {
            tracing::warn!(error = %err, "skipping invalid pattern");
        }
        let count = index.len();
        self.index.store(Arc::new(index));
        tracing::debug!(patterns = count, "pattern index refreshed");
        Ok(count)
    }

    /// Runs [`PatternRefresher::refresh`] every `interval` until shutdown.
    pub(crate) fn spawn(
        self,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> TripwireResult<JoinHandle<()>> {
        let name = "tripwire-pattern-refresh";
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !shutdown.wait_timeout(interval) {
                    if let Err(e) = self.refresh() {
                        tracing::warn!(error = %e, "pattern refresh failed, keeping previous index");
                    }
                }
            })
            .map_err(|e| spawn_error(name, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage::{InMemoryStore, TriggerStore};
    use crate::trigger::Trigger;

    #[test]
    fn refresh_swaps_in_new_index() {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(ArcSwap::from_pointee(PatternIndex::empty()));
        let refresher = PatternRefresher::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&index));

        let before = index.load_full();
        store
            .save_trigger(Trigger::new("t", "a.*").with_thresholds(Some(1.0), None))
            .unwrap();
        assert_eq!(refresher.refresh().unwrap(), 1);

        assert!(before.match_name("a.b").is_empty());
        assert_eq!(index.load().match_name("a.b"), vec!["a.*"]);
    }

    #[test]
    fn store_error_keeps_previous_index() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_trigger(Trigger::new("t", "a.*").with_thresholds(Some(1.0), None))
            .unwrap();
        let index = Arc::new(ArcSwap::from_pointee(PatternIndex::empty()));
        let refresher = PatternRefresher::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&index));
        refresher.refresh().unwrap();

        store.set_unavailable(true);
        assert!(refresher.refresh().is_err());
        assert_eq!(index.load().len(), 1);
    }
}
