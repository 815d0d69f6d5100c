//! Human-readable rendering of an event package.

use std::fmt::Write as _;

use crate::time::format_hhmm;
use crate::trigger::{CheckState, Event, Trigger};

/// Appended to throttled packages.
pub const THROTTLED_HINT: &str =
    "Please, fix your system or tune this trigger to generate less events.";

/// State shown in the subject: the newest state if all events agree, the
/// worst one otherwise.
#[must_use]
pub fn subject_state(events: &[Event]) -> CheckState {
    match events.first() {
        Some(first) if events.iter().all(|e| e.new_state == first.new_state) => first.new_state,
        _ => CheckState::worst_of(events.iter().map(|e| e.new_state)),
    }
}

/// Renders a package as plain text.
///
/// ```text
/// ERROR [prod][db] http://front/#/events/<trigger id> load
/// 12:04: servers.a.load = 81 (WARN to ERROR)
/// ```
#[must_use]
pub fn format_message(events: &[Event], trigger: &Trigger, front_uri: &str, throttled: bool) -> String {
    let mut out = String::new();
    let tags: String = trigger.tags.iter().map(|t| format!("[{t}]")).collect();
    let _ = write!(
        out,
        "{} {} {}/#/events/{} {}",
        subject_state(events),
        tags,
        front_uri.trim_end_matches('/'),
        trigger.id,
        trigger.name
    );
    if let Some(desc) = trigger.desc.as_deref().filter(|d| !d.is_empty()) {
        let _ = write!(out, "\n{desc}");
    }
    out.push('\n');

    for event in events {
        let value = event
            .value
            .map_or_else(|| "-".to_string(), |v| v.to_string());
        let _ = write!(
            out,
            "\n{}: {} = {} ({} to {})",
            format_hhmm(event.timestamp),
            event.metric,
            value,
            event.old_state,
            event.new_state
        );
        if let Some(message) = event.message.as_deref().filter(|m| !m.is_empty()) {
            let _ = write!(out, ". {message}");
        }
    }

    if throttled {
        let _ = write!(out, "\n\n{THROTTLED_HINT}");
    }
    out
}
