use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tripwire::config::{CheckerConfig, FilterConfig, NotifierConfig, SelfStateConfig};
use tripwire::selfstate::SELF_STATE_TRIGGER_NAME;
use tripwire::time::{ManualClock, SharedClock};
use tripwire::{
    CheckState, CheckStore, Config, Contact, Event, InMemoryStore, PipelineBuilder, Sender,
    SenderContext, SenderError, Store, Subscription, SubscriptionStore, Trigger, TriggerStore,
};

#[derive(Debug, Clone)]
struct Received {
    trigger: String,
    contact: String,
    events: Vec<Event>,
    throttled: bool,
}

#[derive(Clone, Default)]
struct Inbox {
    received: Arc<Mutex<Vec<Received>>>,
}

impl Inbox {
    fn events(&self) -> Vec<Event> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .flat_map(|r| r.events.clone())
            .collect()
    }

    fn packages(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

impl Sender for Inbox {
    fn init(&mut self, _ctx: &SenderContext) -> Result<(), SenderError> {
        Ok(())
    }

    fn send_events(
        &mut self,
        events: &[Event],
        contact: &Contact,
        trigger: &Trigger,
        throttled: bool,
    ) -> Result<(), SenderError> {
        self.received.lock().unwrap().push(Received {
            trigger: trigger.name.clone(),
            contact: contact.value.clone(),
            events: events.to_vec(),
            throttled,
        });
        Ok(())
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn config(listen: &str) -> Config {
    Config {
        filter: FilterConfig {
            listen: listen.to_string(),
            workers: 1,
            batch_timeout: Duration::from_millis(10),
            pattern_refresh_interval: Duration::from_millis(20),
            default_retention: Duration::from_secs(1),
            ..FilterConfig::default()
        },
        checker: CheckerConfig {
            check_interval: Duration::from_millis(20),
            max_parallel_checks: 2,
            ..CheckerConfig::default()
        },
        notifier: NotifierConfig {
            sender_timeout: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(5),
            ..NotifierConfig::default()
        },
        ..Config::default()
    }
}

fn seeded_store() -> (Arc<InMemoryStore>, Trigger) {
    let store = Arc::new(InMemoryStore::new());
    let trigger = Trigger::new("load", "servers.*.load")
        .with_thresholds(Some(50.0), Some(75.0))
        .with_ttl(600, CheckState::Ok)
        .with_tags(["prod"]);
    store.save_trigger(trigger.clone()).unwrap();
    let contact = Contact::new("inbox", "ops");
    store.save_contact(contact.clone()).unwrap();
    store
        .save_subscription(Subscription::for_tags(vec![contact.id], ["prod"]))
        .unwrap();
    (store, trigger)
}

#[test]
fn rising_samples_reach_the_contact_in_order() {
    let (store, trigger) = seeded_store();
    let inbox = Inbox::default();
    let pipeline = PipelineBuilder::new(config(""), Arc::clone(&store) as Arc<dyn Store>)
        .sender("inbox", Box::new(inbox.clone()))
        .start()
        .unwrap();

    let now = chrono::Utc::now().timestamp();
    let matcher = pipeline.matcher();
    matcher.ingest(&format!("servers.a.load 40 {}", now - 120)).unwrap();
    matcher.ingest(&format!("servers.a.load 60 {}", now - 60)).unwrap();
    matcher.ingest(&format!("servers.a.load 80 {now}")).unwrap();
    matcher.ingest("servers.b.cpu 99 1700000000").unwrap();

    assert!(wait_until(Duration::from_secs(5), || inbox.events().len() >= 2));
    let metrics = Arc::clone(pipeline.metrics());
    pipeline.shutdown().unwrap();

    let transitions: Vec<_> = inbox
        .events()
        .iter()
        .map(|e| (e.old_state, e.new_state))
        .collect();
    assert_eq!(
        transitions,
        vec![(CheckState::Ok, CheckState::Warn), (CheckState::Warn, CheckState::Error)]
    );
    let packages = inbox.packages();
    assert!(!packages[0].throttled);
    assert_eq!(packages[0].contact, "ops");
    assert_eq!(
        store.get_check_data(trigger.id).unwrap().unwrap().state,
        CheckState::Error
    );

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.filter.received, 4);
    assert_eq!(snapshot.filter.matched, 3);
    assert_eq!(snapshot.filter.unmatched, 1);
}

#[test]
fn tcp_listener_feeds_the_pipeline() {
    let (store, trigger) = seeded_store();
    let inbox = Inbox::default();
    let pipeline = PipelineBuilder::new(config("127.0.0.1:0"), Arc::clone(&store) as Arc<dyn Store>)
        .sender("inbox", Box::new(inbox.clone()))
        .start()
        .unwrap();
    let addr = pipeline.listen_addr().unwrap();

    let now = chrono::Utc::now().timestamp();
    let mut conn = TcpStream::connect(addr).unwrap();
    write!(conn, "not a metric\nservers.a.load 99 {now}\n").unwrap();
    conn.flush().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        store
            .get_check_data(trigger.id)
            .unwrap()
            .is_some_and(|d| d.state == CheckState::Error)
    }));
    assert!(wait_until(Duration::from_secs(5), || !inbox.events().is_empty()));
    assert_eq!(pipeline.metrics().filter.malformed.get(), 1);
    drop(conn);
    pipeline.shutdown().unwrap();
}

#[test]
fn stalled_pipeline_alerts_self_state_contacts() {
    let (store, _) = seeded_store();
    let inbox = Inbox::default();
    let clock = Arc::new(ManualClock::new(chrono::Utc::now().timestamp()));
    let mut cfg = config("");
    cfg.self_state = SelfStateConfig {
        enabled: true,
        check_interval: Duration::from_millis(20),
        last_metric_received_delay: Duration::from_secs(60),
        last_check_delay: Duration::from_secs(600),
        contacts: vec![Contact::new("inbox", "oncall")],
        ..SelfStateConfig::default()
    };
    let pipeline = PipelineBuilder::new(cfg, Arc::clone(&store) as Arc<dyn Store>)
        .clock(Arc::clone(&clock) as SharedClock)
        .sender("inbox", Box::new(inbox.clone()))
        .start()
        .unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(inbox.packages().is_empty());

    clock.advance(120);
    assert!(wait_until(Duration::from_secs(5), || !inbox.packages().is_empty()));
    pipeline.shutdown().unwrap();

    let packages = inbox.packages();
    assert_eq!(packages.len(), 1, "repeat alerts are suppressed");
    assert_eq!(packages[0].trigger, SELF_STATE_TRIGGER_NAME);
    assert_eq!(packages[0].contact, "oncall");
    assert_eq!(packages[0].events[0].metric, "no_metrics_received");
    assert_eq!(packages[0].events[0].new_state, CheckState::Error);
}

#[test]
fn invalid_configuration_is_rejected_at_start() {
    let store = Arc::new(InMemoryStore::new()) as Arc<dyn Store>;
    let mut cfg = config("");
    cfg.checker.check_interval = Duration::ZERO;
    let err = PipelineBuilder::new(cfg, store).start().err().unwrap();
    assert!(err.is_validation());
}

struct Unreachable;

impl Sender for Unreachable {
    fn init(&mut self, ctx: &SenderContext) -> Result<(), SenderError> {
        Err(ctx.config_error("no connectivity"))
    }

    fn send_events(
        &mut self,
        _events: &[Event],
        _contact: &Contact,
        _trigger: &Trigger,
        _throttled: bool,
    ) -> Result<(), SenderError> {
        Ok(())
    }
}

#[test]
fn failing_custom_sender_is_skipped_and_others_deliver() {
    let (store, _) = seeded_store();
    let inbox = Inbox::default();
    let pipeline = PipelineBuilder::new(config(""), Arc::clone(&store) as Arc<dyn Store>)
        .sender("broken", Box::new(Unreachable))
        .sender("inbox", Box::new(inbox.clone()))
        .start()
        .unwrap();

    let now = chrono::Utc::now().timestamp();
    pipeline.matcher().ingest(&format!("servers.a.load 99 {now}")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !inbox.events().is_empty()));
    pipeline.shutdown().unwrap();
}

#[test]
fn duplicate_custom_sender_name_is_rejected() {
    let store = Arc::new(InMemoryStore::new()) as Arc<dyn Store>;
    let err = PipelineBuilder::new(config(""), store)
        .sender("inbox", Box::new(Inbox::default()))
        .sender("inbox", Box::new(Inbox::default()))
        .start()
        .err()
        .unwrap();
    assert!(err.is_validation());
}
