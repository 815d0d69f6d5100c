//! The unit of delivery.

use crate::contact::Contact;
use crate::trigger::{Event, Trigger};

/// Events of one trigger bound for one contact.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPackage {
    pub trigger: Trigger,
    pub contact: Contact,
    /// Events in the order they were produced.
    pub events: Vec<Event>,
    /// Set when the events were held back by throttling.
    pub throttled: bool,
}

impl NotificationPackage {
    /// Creates a package holding a single event.
    #[must_use]
    pub fn new(trigger: Trigger, contact: Contact, event: Event, throttled: bool) -> Self {
        Self {
            trigger,
            contact,
            events: vec![event],
            throttled,
        }
    }
}
