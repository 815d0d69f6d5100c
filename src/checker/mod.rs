//! Trigger checking.
//!
//! [`CheckScheduler`] decides when a trigger is checked, [`TriggerChecker`]
//! performs one check, and the pure functions in [`state`] compute the state
//! transitions. Events leave through an [`EventSink`].

mod check;
mod evaluator;
mod lock;
mod scheduler;
pub mod state;

use crossbeam_channel::Sender;

use crate::error::{ExecutionError, TripwireResult};
use crate::trigger::Event;

pub use check::{CheckReport, TriggerChecker};
pub use evaluator::{EvaluationError, PatternEvaluator, TargetEvaluator, TimeSeries};
pub use lock::{LockArena, SlotGuard};
pub use scheduler::CheckScheduler;
pub use state::{apply_failure, apply_series, classify, Transition};

/// Destination for state-change events.
pub trait EventSink: Send + Sync {
    /// Hands one event over for delivery.
    ///
    /// # Errors
    ///
    /// The receiving side is gone or refuses new events.
    fn publish(&self, event: Event) -> TripwireResult<()>;
}

impl EventSink for Sender<Event> {
    fn publish(&self, event: Event) -> TripwireResult<()> {
        self.send(event).map_err(|_| {
            ExecutionError::Disconnected {
                path: "events".to_string(),
            }
            .into()
        })
    }
}
