//! Storage traits and the in-memory backend.
//!
//! The traits define the operations every stage needs from a backend.
//! [`InMemoryStore`] implements all of them.

mod memory;
mod traits;

pub use memory::{Fixtures, InMemoryStore};
pub use traits::{
    CheckStore, HeartbeatKind, HeartbeatStore, MetricStore, PatternStore, StorageError, Store,
    SubscriptionStore, TriggerStore,
};
