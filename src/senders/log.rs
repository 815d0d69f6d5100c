//! Delivery into the process log, optionally mirrored to a file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::contact::Contact;
use crate::trigger::{Event, Trigger};

use super::format::format_message;
use super::{Sender, SenderContext, SenderError};

/// Writes each package as a formatted message.
///
/// Options: `file` (optional) appends every message, followed by a blank
/// line, to the given path.
#[derive(Debug, Default)]
pub struct LogSender {
    name: String,
    front_uri: String,
    file: Option<PathBuf>,
    span: Option<tracing::Span>,
}

impl Sender for LogSender {
    fn init(&mut self, ctx: &SenderContext) -> Result<(), SenderError> {
        self.file = match ctx.options.get("file") {
            None => None,
            Some(v) => match v.as_str() {
                Some(path) if !path.trim().is_empty() => Some(PathBuf::from(path)),
                _ => return Err(ctx.config_error("file must be a non-empty string")),
            },
        };
        self.name = ctx.name.clone();
        self.front_uri = ctx.front_uri.clone();
        self.span = Some(ctx.span.clone());
        Ok(())
    }

    fn send_events(
        &mut self,
        events: &[Event],
        contact: &Contact,
        trigger: &Trigger,
        throttled: bool,
    ) -> Result<(), SenderError> {
        let span = self.span.clone().unwrap_or_else(tracing::Span::none);
        let _entered = span.enter();

        let message = format_message(events, trigger, &self.front_uri, throttled);
        tracing::info!(
            contact = %contact.value,
            trigger_id = %trigger.id,
            events = events.len(),
            throttled,
            "{message}"
        );

        if let Some(path) = &self.file {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| {
                    writeln!(f, "{message}\n")?;
                    Ok(f)
                })
                .map_err(|e| SenderError::Delivery {
                    sender: self.name.clone(),
                    contact: contact.value.clone(),
                    reason: format!("failed to append to {}: {e}", path.display()),
                })?;
            let _ = file.flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::trigger::{CheckState, TriggerId};

    fn ctx(options: BTreeMap<String, serde_json::Value>) -> SenderContext {
        SenderContext {
            name: "log".to_string(),
            kind: "log".to_string(),
            front_uri: "http://front".to_string(),
            options,
            timeout: Duration::from_secs(1),
            span: tracing::Span::none(),
        }
    }

    #[test]
    fn appends_formatted_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.log");
        let mut options = BTreeMap::new();
        options.insert(
            "file".to_string(),
            serde_json::json!(path.to_string_lossy()),
        );
        let mut sender = LogSender::default();
        sender.init(&ctx(options)).unwrap();

        let trigger = Trigger::new("load", "a.*");
        let event = Event::transition(TriggerId::new(), "a.b", CheckState::Ok, CheckState::Warn, 0)
            .with_value(Some(1.5));
        let contact = Contact::new("log", "ops");
        sender.send_events(&[event.clone()], &contact, &trigger, false).unwrap();
        sender.send_events(&[event], &contact, &trigger, true).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("a.b = 1.5 (OK to WARN)").count(), 2);
        assert_eq!(text.matches("fix your system").count(), 1);
    }

    #[test]
    fn rejects_non_string_file() {
        let mut options = BTreeMap::new();
        options.insert("file".to_string(), serde_json::json!(42));
        assert!(LogSender::default().init(&ctx(options)).is_err());
        assert!(LogSender::default().init(&ctx(BTreeMap::new())).is_ok());
    }
}
