//! Delivery by running a local executable.
//!
//! The `exec` option is a command line split on spaces. `${trigger_name}` and
//! `${contact_value}` are substituted per delivery. The package is written to
//! the child's stdin as JSON; a non-zero exit status is a failed delivery.
//! A script still running after the sender timeout is killed.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::contact::Contact;
use crate::trigger::{Event, Trigger};

use super::{Sender, SenderContext, SenderError};

#[derive(Serialize)]
struct ScriptPayload<'a> {
    events: &'a [Event],
    trigger: &'a Trigger,
    contact: &'a Contact,
    throttled: bool,
    timestamp: i64,
}

/// Runs a script for every package.
#[derive(Debug, Default)]
pub struct ScriptSender {
    name: String,
    exec: String,
    timeout: Duration,
    span: Option<tracing::Span>,
}

impl ScriptSender {
    fn delivery_error(&self, contact: &Contact, reason: impl Into<String>) -> SenderError {
        SenderError::Delivery {
            sender: self.name.clone(),
            contact: contact.value.clone(),
            reason: reason.into(),
        }
    }
}

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Kills and reaps a child that will not be waited for normally.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Feeds stdin, then collects stdout. A script that exits without reading
/// its input is not an error.
fn exchange(
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    if let Some(mut stdin) = stdin {
        match stdin.write_all(payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }
    }
    let mut out = Vec::new();
    if let Some(mut stdout) = stdout {
        stdout.read_to_end(&mut out)?;
    }
    Ok(out)
}

fn check_executable(path: &str) -> Result<(), String> {
    let meta = std::fs::metadata(Path::new(path)).map_err(|_| format!("file {path} not found"))?;
    if !meta.is_file() {
        return Err(format!("{path} is not a file"));
    }
    Ok(())
}

impl Sender for ScriptSender {
    fn init(&mut self, ctx: &SenderContext) -> Result<(), SenderError> {
        let exec = ctx
            .option_str("exec")
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ctx.config_error("exec cannot be empty for script type"))?;
        let program = exec.split(' ').next().unwrap_or_default();
        check_executable(program).map_err(|reason| ctx.config_error(reason))?;

        self.name = ctx.name.clone();
        self.exec = exec.to_string();
        self.timeout = ctx.timeout;
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

        let line = self
            .exec
            .replace("${trigger_name}", &trigger.name)
            .replace("${contact_value}", &contact.value);
        let mut args = line.split(' ').filter(|a| !a.is_empty());
        let program = args
            .next()
            .ok_or_else(|| self.delivery_error(contact, "empty command line"))?;
        check_executable(program).map_err(|reason| self.delivery_error(contact, reason))?;

        let payload = serde_json::to_vec_pretty(&ScriptPayload {
            events,
            trigger,
            contact,
            throttled,
            timestamp: chrono::Utc::now().timestamp(),
        })
        .map_err(|e| self.delivery_error(contact, format!("failed to encode payload: {e}")))?;

        tracing::debug!(program, "executing script");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.delivery_error(contact, format!("failed to start {program}: {e}")))?;

        let (stdin, stdout) = (child.stdin.take(), child.stdout.take());
        let io = match thread::Builder::new()
            .name("tripwire-script-io".to_string())
            .spawn(move || exchange(stdin, stdout, &payload))
        {
            Ok(handle) => handle,
            Err(e) => {
                reap(&mut child);
                return Err(self.delivery_error(contact, format!("failed to spawn io thread: {e}")));
            }
        };

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    // The io thread ends once every holder of the pipes is gone.
                    reap(&mut child);
                    drop(io);
                    tracing::warn!(program, "script timed out, killed");
                    return Err(SenderError::Timeout {
                        sender: self.name.clone(),
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(e) => {
                    reap(&mut child);
                    drop(io);
                    return Err(self.delivery_error(contact, format!("failed to wait for {program}: {e}")));
                }
            }
        };
        let stdout = match io.join() {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(self.delivery_error(contact, format!("script io failed: {e}")));
            }
            Err(_) => return Err(self.delivery_error(contact, "script io thread panicked")),
        };
        tracing::debug!(program, %status, "script finished");

        if !status.success() {
            return Err(self.delivery_error(
                contact,
                format!(
                    "exec [{}] exited with {}, output: [{}]",
                    self.exec,
                    status,
                    String::from_utf8_lossy(&stdout).trim()
                ),
            ));
        }
        Ok(())
    }
}
