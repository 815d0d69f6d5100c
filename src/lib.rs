//! # tripwire - streaming metrics alerting
//!
//! tripwire watches a stream of Graphite-style samples and turns threshold
//! crossings into throttled notifications. The pipeline has four stages:
//!
//! - **Filter**: parses `name value timestamp` lines, matches metric names
//!   against the patterns of all triggers and stores the matched samples
//! - **Checker**: re-evaluates triggers with fresh data (and periodically all
//!   of them, to detect NODATA), records state and emits transition events
//! - **Notifier**: routes events to subscribed contacts, throttles bursts and
//!   delivers through senders with bounded retries
//! - **Self-state**: alerts operators when the pipeline itself stalls
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tripwire::{Config, InMemoryStore, PipelineBuilder, Store, Trigger, TriggerStore};
//!
//! # fn main() -> tripwire::TripwireResult<()> {
//! let store = Arc::new(InMemoryStore::new());
//! store.save_trigger(
//!     Trigger::new("api latency", "servers.*.api.p99").with_thresholds(Some(250.0), Some(500.0)),
//! )?;
//!
//! let pipeline = PipelineBuilder::new(Config::default(), store as Arc<dyn Store>).start()?;
//! pipeline.matcher().ingest("servers.a.api.p99 612 1700000000").ok();
//! pipeline.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod contact;
pub mod error;
pub mod metric;
pub mod pattern;
pub mod time;
pub mod trigger;

// Runtime plumbing
pub mod config;
pub mod metrics;
pub mod shutdown;
pub mod storage;

// Stages
pub mod checker;
pub mod filter;
pub mod notifier;
pub mod pipeline;
pub mod selfstate;
pub mod senders;

// Re-export primary types at crate root for convenience
pub use config::Config;
pub use contact::{Contact, ContactId, Subscription, SubscriptionId};
pub use error::{ExecutionError, TripwireError, TripwireResult, ValidationError};
pub use metric::{MatchedMetric, Metric, MetricValue};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pattern::GlobPattern;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use shutdown::ShutdownSignal;
pub use trigger::{CheckData, CheckState, Event, Trigger, TriggerId};

pub use checker::{EventSink, TargetEvaluator};
pub use notifier::{NotificationPackage, NotifierHandle};
pub use senders::{Sender, SenderContext, SenderError};
pub use storage::{
    CheckStore, Fixtures, HeartbeatKind, HeartbeatStore, InMemoryStore, MetricStore, PatternStore,
    StorageError, Store, SubscriptionStore, TriggerStore,
};
