//! Per-sender delivery.
//!
//! Each sender gets a consumer thread reading a bounded mailbox and an
//! executor thread that owns the `Sender`. The consumer keeps one FIFO queue
//! per contact and hands packages to the executor one at a time, bounding
//! every attempt by the sender timeout. A hung executor only costs its own
//! sender; the consumer keeps counting timeouts and rescheduling.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender as Tx};
use crossbeam_utils::sync::WaitGroup;

use crate::contact::ContactId;
use crate::error::{spawn_error, TripwireResult};
use crate::metrics::{PipelineMetrics, SenderMetrics};
use crate::senders::{Sender, SenderError};

use super::package::NotificationPackage;
use super::retry::ResendPolicy;

/// Longest sleep of an idle consumer.
const IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub sender_timeout: Duration,
    pub policy: ResendPolicy,
    pub shutdown_timeout: Duration,
}

struct Job {
    seq: u64,
    package: Arc<NotificationPackage>,
}

struct Reply {
    seq: u64,
    result: Result<(), SenderError>,
}

struct Queued {
    package: Arc<NotificationPackage>,
    attempt: u32,
    not_before: Instant,
}

/// Spawns the consumer and executor threads for one sender.
pub(crate) fn spawn_worker(
    name: &str,
    sender: Box<dyn Sender>,
    span: tracing::Span,
    mailbox: Receiver<NotificationPackage>,
    settings: WorkerSettings,
    metrics: &Arc<PipelineMetrics>,
    wg: WaitGroup,
) -> TripwireResult<()> {
    let (job_tx, job_rx) = bounded::<Job>(0);
    let (reply_tx, reply_rx) = bounded::<Reply>(1);

    let exec_name = format!("tripwire-send-{name}");
    let exec_span = span.clone();
    thread::Builder::new()
        .name(exec_name.clone())
        .spawn(move || executor_loop(sender, &job_rx, &reply_tx, &exec_span))
        .map_err(|e| spawn_error(&exec_name, &e))?;

    let consumer = Consumer {
        name: name.to_string(),
        mailbox,
        jobs: job_tx,
        replies: reply_rx,
        settings,
        metrics: Arc::clone(metrics),
        sender_metrics: metrics.sender(name),
        seq: 0,
    };
    let consumer_name = format!("tripwire-mailbox-{name}");
    thread::Builder::new()
        .name(consumer_name.clone())
        .spawn(move || {
            let _entered = span.enter();
            consumer.run();
            drop(wg);
        })
        .map_err(|e| spawn_error(&consumer_name, &e))?;
    Ok(())
}

fn executor_loop(
    mut sender: Box<dyn Sender>,
    jobs: &Receiver<Job>,
    replies: &Tx<Reply>,
    span: &tracing::Span,
) {
    let _entered = span.enter();
    for job in jobs {
        let p = &job.package;
        let result = sender.send_events(&p.events, &p.contact, &p.trigger, p.throttled);
        if replies.try_send(Reply { seq: job.seq, result }).is_err() {
            tracing::debug!(seq = job.seq, "delivery result arrived after timeout");
        }
    }
}

struct Consumer {
    name: String,
    mailbox: Receiver<NotificationPackage>,
    jobs: Tx<Job>,
    replies: Receiver<Reply>,
    settings: WorkerSettings,
    metrics: Arc<PipelineMetrics>,
    sender_metrics: Arc<SenderMetrics>,
    seq: u64,
}

impl Consumer {
    fn run(mut self) {
        let mut queues: BTreeMap<ContactId, VecDeque<Queued>> = BTreeMap::new();
        let mut deadline: Option<Instant> = None;

        loop {
            self.deliver_due(&mut queues);
            let now = Instant::now();
            let next = queues
                .values()
                .filter_map(|q| q.front().map(|item| item.not_before))
                .min();

            match deadline {
                None => {
                    let wait = next.map_or(IDLE_WAIT, |t| t.saturating_duration_since(now).min(IDLE_WAIT));
                    match self.mailbox.recv_timeout(wait) {
                        Ok(package) => {
                            enqueue(&mut queues, package);
                            for package in self.mailbox.try_iter() {
                                enqueue(&mut queues, package);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            deadline = Some(now + self.settings.shutdown_timeout);
                        }
                    }
                }
                Some(deadline) => {
                    if queues.is_empty() {
                        break;
                    }
                    if now >= deadline {
                        self.abandon(queues);
                        break;
                    }
                    let wake = next.map_or(deadline, |t| t.min(deadline));
                    thread::sleep(wake.saturating_duration_since(now));
                }
            }
        }
        tracing::debug!(sender = %self.name, "sender consumer stopped");
    }

    fn deliver_due(&mut self, queues: &mut BTreeMap<ContactId, VecDeque<Queued>>) {
        for queue in queues.values_mut() {
            while let Some(head) = queue.front() {
                if head.not_before > Instant::now() {
                    break;
                }
                let Some(mut item) = queue.pop_front() else {
                    break;
                };
                match self.attempt(&item.package) {
                    Ok(()) => {
                        self.metrics.notifier.sent.inc();
                        self.sender_metrics.sent.inc();
                    }
                    Err(e) => match self.settings.policy.delay_after(item.attempt) {
                        Some(delay) => {
                            tracing::warn!(
                                sender = %self.name,
                                contact = %item.package.contact.value,
                                attempt = item.attempt + 1,
                                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error = %e,
                                "delivery failed, will resend"
                            );
                            self.metrics.notifier.resends.inc();
                            item.attempt += 1;
                            item.not_before = Instant::now() + delay;
                            queue.push_front(item);
                            break;
                        }
                        None => {
                            tracing::error!(
                                sender = %self.name,
                                contact = %item.package.contact.value,
                                trigger_id = %item.package.trigger.id,
                                events = item.package.events.len(),
                                error = %e,
                                "delivery failed, giving up"
                            );
                            self.record_failure();
                        }
                    },
                }
            }
        }
        queues.retain(|_, q| !q.is_empty());
    }

    fn attempt(&mut self, package: &Arc<NotificationPackage>) -> Result<(), SenderError> {
        let timeout = self.settings.sender_timeout;
        let timed_out = || SenderError::Timeout {
            sender: self.name.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };

        while self.replies.try_recv().is_ok() {}
        self.seq += 1;
        let job = Job {
            seq: self.seq,
            package: Arc::clone(package),
        };
        match self.jobs.send_timeout(job, timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(timed_out()),
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(SenderError::Delivery {
                    sender: self.name.clone(),
                    contact: package.contact.value.clone(),
                    reason: "sender executor is gone".to_string(),
                })
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.replies.recv_deadline(deadline) {
                Ok(reply) if reply.seq == self.seq => return reply.result,
                Ok(_) => {}
                Err(_) => return Err(timed_out()),
            }
        }
    }

    fn record_failure(&self) {
        self.metrics.notifier.failed.inc();
        self.sender_metrics.failed.inc();
    }

    fn abandon(&self, queues: BTreeMap<ContactId, VecDeque<Queued>>) {
        let left: usize = queues.values().map(VecDeque::len).sum();
        tracing::error!(sender = %self.name, packages = left, "shutdown timeout, dropping undelivered packages");
        for _ in 0..left {
            self.record_failure();
        }
    }
}

fn enqueue(queues: &mut BTreeMap<ContactId, VecDeque<Queued>>, package: NotificationPackage) {
    queues
        .entry(package.contact.id)
        .or_default()
        .push_back(Queued {
            package: Arc::new(package),
            attempt: 0,
            not_before: Instant::now(),
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::contact::Contact;
    use crate::senders::SenderContext;
    use crate::trigger::{CheckState, Event, Trigger};

    #[derive(Clone, Default)]
    struct Recorder {
        delivered: Arc<Mutex<Vec<String>>>,
        fail_first: Arc<Mutex<u32>>,
    }

    impl Sender for Recorder {
        fn init(&mut self, _ctx: &SenderContext) -> Result<(), SenderError> {
            Ok(())
        }

        fn send_events(
            &mut self,
            events: &[Event],
            contact: &Contact,
            _trigger: &Trigger,
            _throttled: bool,
        ) -> Result<(), SenderError> {
            let mut left = self.fail_first.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(SenderError::Delivery {
                    sender: "rec".to_string(),
                    contact: contact.value.clone(),
                    reason: "flaky".to_string(),
                });
            }
            self.delivered
                .lock()
                .unwrap()
                .push(format!("{}:{}", contact.value, events[0].timestamp));
            Ok(())
        }
    }

    fn package(contact: &Contact, ts: i64) -> NotificationPackage {
        let trigger = Trigger::new("t", "a.*");
        let event = Event::transition(trigger.id, "a.b", CheckState::Ok, CheckState::Error, ts);
        NotificationPackage::new(trigger, contact.clone(), event, false)
    }

    fn settings(resends: u32) -> WorkerSettings {
        WorkerSettings {
            sender_timeout: Duration::from_secs(2),
            policy: ResendPolicy::new(Duration::from_millis(5), Duration::from_millis(20), resends),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn delivers_in_order_and_retries_failures() {
        let recorder = Recorder::default();
        *recorder.fail_first.lock().unwrap() = 2;
        let metrics = PipelineMetrics::new();
        let (tx, rx) = bounded(16);
        let wg = WaitGroup::new();
        spawn_worker(
            "rec",
            Box::new(recorder.clone()),
            tracing::Span::none(),
            rx,
            settings(5),
            &metrics,
            wg.clone(),
        )
        .unwrap();

        let ops = Contact::new("rec", "ops");
        for ts in 1..=3 {
            tx.send(package(&ops, ts)).unwrap();
        }
        drop(tx);
        wg.wait();

        assert_eq!(
            *recorder.delivered.lock().unwrap(),
            vec!["ops:1", "ops:2", "ops:3"]
        );
        assert_eq!(metrics.notifier.sent.get(), 3);
        assert_eq!(metrics.notifier.resends.get(), 2);
        assert_eq!(metrics.sender("rec").sent.get(), 3);
    }

    #[test]
    fn exhausted_resends_are_counted_as_failed() {
        let recorder = Recorder::default();
        *recorder.fail_first.lock().unwrap() = 100;
        let metrics = PipelineMetrics::new();
        let (tx, rx) = bounded(16);
        let wg = WaitGroup::new();
        spawn_worker(
            "rec",
            Box::new(recorder.clone()),
            tracing::Span::none(),
            rx,
            settings(2),
            &metrics,
            wg.clone(),
        )
        .unwrap();

        tx.send(package(&Contact::new("rec", "ops"), 1)).unwrap();
        drop(tx);
        wg.wait();

        assert!(recorder.delivered.lock().unwrap().is_empty());
        assert_eq!(metrics.notifier.failed.get(), 1);
        assert_eq!(metrics.notifier.resends.get(), 2);
        assert_eq!(metrics.sender("rec").failed.get(), 1);
    }
}
