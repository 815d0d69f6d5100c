//! Per (trigger, contact) throttling.
//!
//! The first event for a key opens a window and goes out at once. Events
//! arriving while the window is open are coalesced into one pending package,
//! released when the window closes. Releasing a package opens the next window,
//! so a noisy trigger produces at most one package per window per contact.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::contact::{Contact, ContactId};
use crate::trigger::{Event, Trigger, TriggerId};

use super::package::NotificationPackage;

type Key = (TriggerId, ContactId);

#[derive(Debug)]
struct Window {
    closes_at: Instant,
    pending: Option<NotificationPackage>,
}

/// Throttling state.
#[derive(Debug)]
pub struct Throttler {
    window: Duration,
    windows: HashMap<Key, Window>,
}

impl Throttler {
    /// Creates a throttler with the given window length.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            windows: HashMap::new(),
        }
    }

    /// Offers one event. Returns the package to deliver right away, or `None`
    /// if the event was held back.
    pub fn offer(
        &mut self,
        now: Instant,
        trigger: &Trigger,
        contact: &Contact,
        event: Event,
    ) -> Option<NotificationPackage> {
        let key = (trigger.id, contact.id);
        match self.windows.get_mut(&key) {
            Some(window) if now < window.closes_at => {
                if let Some(package) = &mut window.pending {
                    package.events.push(event);
                } else {
                    window.pending = Some(NotificationPackage::new(
                        trigger.clone(),
                        contact.clone(),
                        event,
                        true,
                    ));
                }
                None
            }
            Some(window) => {
                // Expired but not flushed yet: the held events go out first,
                // together with this one.
                window.closes_at = now + self.window;
                match window.pending.take() {
                    Some(mut package) => {
                        package.events.push(event);
                        Some(package)
                    }
                    None => Some(NotificationPackage::new(
                        trigger.clone(),
                        contact.clone(),
                        event,
                        false,
                    )),
                }
            }
            None => {
                self.windows.insert(
                    key,
                    Window {
                        closes_at: now + self.window,
                        pending: None,
                    },
                );
                Some(NotificationPackage::new(
                    trigger.clone(),
                    contact.clone(),
                    event,
                    false,
                ))
            }
        }
    }

    /// Closes every expired window and returns the packages they held.
    pub fn due(&mut self, now: Instant) -> Vec<NotificationPackage> {
        let mut out = Vec::new();
        let window = self.window;
        self.windows.retain(|_, w| {
            if now < w.closes_at {
                return true;
            }
            match w.pending.take() {
                Some(package) => {
                    out.push(package);
                    w.closes_at = now + window;
                    true
                }
                None => false,
            }
        });
        out
    }

    /// Releases every pending package regardless of its window.
    pub fn drain(&mut self) -> Vec<NotificationPackage> {
        self.windows
            .drain()
            .filter_map(|(_, w)| w.pending)
            .collect()
    }

    /// Number of open windows.
    #[must_use]
    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }
}
