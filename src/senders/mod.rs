//! Delivery channels.
//!
//! A [`Sender`] is owned by exactly one executor thread in the notifier, so
//! implementations keep their configuration and connection state in plain
//! fields without locking. The bundled channels are selected by their type
//! string through [`build_sender`]; embedders register their own with
//! `Notifier::register_sender`.

mod format;
mod log;
mod script;

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::contact::Contact;
use crate::trigger::{Event, Trigger};

pub use format::{format_message, subject_state, THROTTLED_HINT};
pub use log::LogSender;
pub use script::ScriptSender;

/// Errors raised by a delivery channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SenderError {
    /// The channel cannot be set up from its settings. Not retried.
    #[error("sender '{sender}' misconfigured: {reason}")]
    Config {
        sender: String,
        reason: String,
    },

    /// One delivery attempt failed.
    #[error("sender '{sender}' failed to deliver to '{contact}': {reason}")]
    Delivery {
        sender: String,
        contact: String,
        reason: String,
    },

    /// The attempt did not finish within the sender timeout.
    #[error("sender '{sender}' timed out after {timeout_ms}ms")]
    Timeout {
        sender: String,
        timeout_ms: u64,
    },
}

/// Everything a sender receives at initialization.
#[derive(Debug, Clone)]
pub struct SenderContext {
    /// Configured sender name, also the contact type it serves.
    pub name: String,
    /// Channel type, e.g. `script`.
    pub kind: String,
    /// Base URI of the web front, used for links in messages.
    pub front_uri: String,
    /// Channel-specific settings.
    pub options: BTreeMap<String, serde_json::Value>,
    /// Upper bound for one delivery attempt.
    pub timeout: Duration,
    /// Span the sender should log under.
    pub span: tracing::Span,
}

impl SenderContext {
    /// Returns a string option, if present and a string.
    #[must_use]
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(serde_json::Value::as_str)
    }

    /// Builds a `SenderError::Config` for this sender.
    #[must_use]
    pub fn config_error(&self, reason: impl Into<String>) -> SenderError {
        SenderError::Config {
            sender: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// A notification channel.
pub trait Sender: Send {
    /// Reads settings and validates that the channel can work.
    ///
    /// # Errors
    ///
    /// `SenderError::Config` when the settings are unusable; the sender is then
    /// left out of the running notifier.
    fn init(&mut self, ctx: &SenderContext) -> Result<(), SenderError>;

    /// Delivers one package of events for one contact.
    ///
    /// # Errors
    ///
    /// Any failure; the package is retried with backoff.
    fn send_events(
        &mut self,
        events: &[Event],
        contact: &Contact,
        trigger: &Trigger,
        throttled: bool,
    ) -> Result<(), SenderError>;
}

/// Sender types known to [`build_sender`].
pub const KNOWN_SENDER_TYPES: &[&str] = &["script", "log"];

/// Creates an uninitialized sender for a type string.
#[must_use]
pub fn build_sender(kind: &str) -> Option<Box<dyn Sender>> {
    match kind {
        "script" => Some(Box::new(ScriptSender::default())),
        "log" => Some(Box::new(LogSender::default())),
        _ => None,
    }
}
