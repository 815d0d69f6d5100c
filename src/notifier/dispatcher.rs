//! Event intake and routing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Receiver, Sender, TrySendError};

use crate::metrics::PipelineMetrics;
use crate::storage::{Store, SubscriptionStore, TriggerStore};
use crate::trigger::Event;

use super::package::NotificationPackage;
use super::throttle::Throttler;

/// Routes events to sender mailboxes.
pub(crate) struct Dispatcher {
    pub store: Arc<dyn Store>,
    pub metrics: Arc<PipelineMetrics>,
    pub mailboxes: BTreeMap<String, Sender<NotificationPackage>>,
    pub throttler: Throttler,
}

impl Dispatcher {
    /// Runs until `stop` fires, then drains the intake queues and flushes
    /// throttled packages. Dropping `self` afterwards closes the mailboxes.
    pub fn run(
        mut self,
        events: &Receiver<Event>,
        direct: &Receiver<NotificationPackage>,
        stop: &Receiver<()>,
        flush_every: Duration,
    ) {
        let flush = tick(flush_every);
        loop {
            select! {
                recv(events) -> msg => match msg {
                    Ok(event) => self.route(event),
                    Err(_) => break,
                },
                recv(direct) -> msg => match msg {
                    Ok(package) => self.deliver(package),
                    Err(_) => break,
                },
                recv(flush) -> _ => self.flush(Instant::now()),
                recv(stop) -> _ => break,
            }
        }

        for event in events.try_iter() {
            self.route(event);
        }
        for package in direct.try_iter() {
            self.deliver(package);
        }
        for package in self.throttler.drain() {
            self.deliver(package);
        }
        tracing::debug!("notifier intake stopped");
    }

    fn flush(&mut self, now: Instant) {
        for package in self.throttler.due(now) {
            self.deliver(package);
        }
    }

    /// Resolves an event into per-contact packages.
    pub fn route(&mut self, event: Event) {
        self.metrics.notifier.events_received.inc();
        let trigger = match self.store.get_trigger(event.trigger_id) {
            Ok(Some(trigger)) => trigger,
            Ok(None) => {
                self.metrics.notifier.unroutable.inc();
                tracing::debug!(trigger_id = %event.trigger_id, "event for unknown trigger");
                return;
            }
            Err(e) => {
                self.metrics.notifier.store_errors.inc();
                tracing::warn!(trigger_id = %event.trigger_id, error = %e, "failed to load trigger");
                return;
            }
        };
        let subscriptions = match self.store.get_trigger_subscriptions(&trigger) {
            Ok(subs) => subs,
            Err(e) => {
                self.metrics.notifier.store_errors.inc();
                tracing::warn!(trigger_id = %trigger.id, error = %e, "failed to load subscriptions");
                return;
            }
        };

        let contact_ids: BTreeSet<_> = subscriptions
            .iter()
            .filter(|s| s.matches(&trigger) && s.accepts(&event))
            .flat_map(|s| s.contacts.iter().copied())
            .collect();
        if contact_ids.is_empty() {
            tracing::debug!(trigger_id = %trigger.id, "no subscription accepts event");
            return;
        }

        let now = Instant::now();
        for id in contact_ids {
            let contact = match self.store.get_contact(id) {
                Ok(Some(contact)) => contact,
                Ok(None) => {
                    self.metrics.notifier.unroutable.inc();
                    continue;
                }
                Err(e) => {
                    self.metrics.notifier.store_errors.inc();
                    tracing::warn!(contact_id = %id, error = %e, "failed to load contact");
                    continue;
                }
            };
            if !self.mailboxes.contains_key(&contact.kind) {
                self.metrics.notifier.unroutable.inc();
                tracing::warn!(contact = %contact.value, kind = %contact.kind, "no sender for contact type");
                continue;
            }
            match self.throttler.offer(now, &trigger, &contact, event.clone()) {
                Some(package) => self.deliver(package),
                None => self.metrics.notifier.throttled.inc(),
            }
        }
    }

    /// Puts a package into its sender's mailbox without blocking.
    pub fn deliver(&self, package: NotificationPackage) {
        let Some(mailbox) = self.mailboxes.get(&package.contact.kind) else {
            self.metrics.notifier.unroutable.inc();
            return;
        };
        match mailbox.try_send(package) {
            Ok(()) => {}
            Err(TrySendError::Full(p) | TrySendError::Disconnected(p)) => {
                self.metrics.notifier.dropped_mailbox.inc();
                tracing::warn!(sender = %p.contact.kind, contact = %p.contact.value, "sender mailbox full, package dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam_channel::bounded;

    use crate::contact::{Contact, Subscription};
    use crate::storage::InMemoryStore;
    use crate::trigger::{CheckState, Trigger};

    struct Setup {
        dispatcher: Dispatcher,
        outbox: Receiver<NotificationPackage>,
        trigger: Trigger,
    }

    fn setup(subscription: impl FnOnce(&Contact, &Trigger) -> Subscription) -> Setup {
        let store = Arc::new(InMemoryStore::new());
        let trigger = Trigger::new("load", "a.*")
            .with_thresholds(None, Some(1.0))
            .with_tags(["prod"]);
        store.save_trigger(trigger.clone()).unwrap();
        let contact = Contact::new("log", "ops");
        store.save_contact(contact.clone()).unwrap();
        store.save_subscription(subscription(&contact, &trigger)).unwrap();

        let (tx, outbox) = bounded(8);
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert("log".to_string(), tx);
        Setup {
            dispatcher: Dispatcher {
                store,
                metrics: PipelineMetrics::new(),
                mailboxes,
                throttler: Throttler::new(Duration::from_secs(60)),
            },
            outbox,
            trigger,
        }
    }

    #[test]
    fn routes_by_tags_and_throttles_repeats() {
        let mut s = setup(|c, _| Subscription::for_tags(vec![c.id], ["prod"]));
        let id = s.trigger.id;
        s.dispatcher
            .route(Event::transition(id, "a.b", CheckState::Ok, CheckState::Error, 1));
        s.dispatcher
            .route(Event::transition(id, "a.b", CheckState::Error, CheckState::Ok, 2));

        let first = s.outbox.try_recv().unwrap();
        assert!(!first.throttled);
        assert!(s.outbox.try_recv().is_err());
        assert_eq!(s.dispatcher.metrics.notifier.throttled.get(), 1);

        for p in s.dispatcher.throttler.drain() {
            s.dispatcher.deliver(p);
        }
        let held = s.outbox.try_recv().unwrap();
        assert!(held.throttled);
        assert_eq!(held.events[0].timestamp, 2);
    }

    #[test]
    fn ignore_flags_filter_events() {
        let mut s = setup(|c, t| {
            let mut sub = Subscription::for_triggers(vec![c.id], vec![t.id]);
            sub.ignore_warnings = true;
            sub.ignore_recoverings = true;
            sub
        });
        let id = s.trigger.id;
        s.dispatcher
            .route(Event::transition(id, "a.b", CheckState::Ok, CheckState::Warn, 1));
        s.dispatcher
            .route(Event::transition(id, "a.b", CheckState::Error, CheckState::Warn, 2));
        assert!(s.outbox.try_recv().is_err());

        s.dispatcher
            .route(Event::transition(id, "a.b", CheckState::Warn, CheckState::Error, 3));
        assert_eq!(s.outbox.try_recv().unwrap().events[0].timestamp, 3);
    }

    #[test]
    fn contact_without_sender_is_unroutable() {
        let mut s = setup(|c, _| Subscription::for_tags(vec![c.id], ["prod"]));
        s.dispatcher.mailboxes.clear();
        s.dispatcher.route(Event::transition(
            s.trigger.id,
            "a.b",
            CheckState::Ok,
            CheckState::Error,
            1,
        ));
        assert_eq!(s.dispatcher.metrics.notifier.unroutable.get(), 1);
    }
}
