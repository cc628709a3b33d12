// Integration tests for `ChangeChannel` against an in-memory broker.
#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::watch;

use lookout_api::changes::NotificationSink;
use lookout_api::{BrokerConnector, BrokerParams, BrokerSession, ChangeChannel, Error};

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeBroker {
    connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    refuse: AtomicBool,
    alive: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
    sink: Mutex<Option<NotificationSink>>,
    last_params: Mutex<Option<BrokerParams>>,
}

impl FakeBroker {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn publish(&self, topic: &str, payload: &str) {
        let sink = self.sink.lock().unwrap().clone().expect("not connected");
        sink.deliver(topic, payload.as_bytes());
    }
}

struct FakeConnector(Arc<FakeBroker>);

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(
        &self,
        params: watch::Receiver<Option<BrokerParams>>,
        sink: NotificationSink,
    ) -> Result<Box<dyn BrokerSession>, Error> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        *self.0.last_params.lock().unwrap() = params.borrow().clone();

        let delay = *self.0.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(Error::ConnectionRefused { code: 5 });
        }

        *self.0.sink.lock().unwrap() = Some(sink);
        self.0.alive.store(true, Ordering::SeqCst);
        Ok(Box::new(FakeSession(self.0.clone())))
    }
}

struct FakeSession(Arc<FakeBroker>);

#[async_trait]
impl BrokerSession for FakeSession {
    async fn subscribe(&self, filter: &str) -> Result<(), Error> {
        if self.0.rejected.lock().unwrap().contains(filter) {
            return Err(Error::SubscribeRejected {
                topic: filter.to_owned(),
            });
        }
        self.0.record(format!("sub {filter}"));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        self.0.record(format!("unsub {filter}"));
        Ok(())
    }

    async fn close(&self) {
        self.0.record("close".into());
    }

    fn is_alive(&self) -> bool {
        self.0.alive.load(Ordering::SeqCst)
    }
}

fn setup() -> (Arc<FakeBroker>, ChangeChannel) {
    setup_with_timeout(Duration::from_secs(10))
}

fn setup_with_timeout(timeout: Duration) -> (Arc<FakeBroker>, ChangeChannel) {
    let broker = Arc::new(FakeBroker::default());
    let channel = ChangeChannel::with_connect_timeout(Arc::new(FakeConnector(broker.clone())), timeout);
    (broker, channel)
}

fn configure(channel: &ChangeChannel, token: &str) {
    channel.configure("broker.example.com", 9883, true, SecretString::from(token.to_owned()));
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_connect_requires_configure() {
    let (broker, channel) = setup();

    let err = channel.ensure_connected().await.unwrap_err();

    assert!(matches!(err, Error::NotConfigured), "got {err:?}");
    assert_eq!(broker.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_configure_passes_params_through() {
    let (broker, channel) = setup();
    configure(&channel, "tok");

    channel.ensure_connected().await.unwrap();

    let params = broker.last_params.lock().unwrap().clone().unwrap();
    assert_eq!(params.host, "broker.example.com");
    assert_eq!(params.port, 9883);
    assert!(params.secure);
    assert!(channel.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_ensure_connected_shares_one_attempt() {
    let (broker, channel) = setup();
    *broker.connect_delay.lock().unwrap() = Duration::from_millis(200);
    configure(&channel, "tok");

    let (a, b, c) = tokio::join!(
        channel.ensure_connected(),
        channel.ensure_connected(),
        channel.ensure_connected(),
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(broker.connects.load(Ordering::SeqCst), 1);

    // Already connected: no new attempt.
    channel.ensure_connected().await.unwrap();
    assert_eq!(broker.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_all_see_the_failure() {
    let (broker, channel) = setup();
    *broker.connect_delay.lock().unwrap() = Duration::from_millis(200);
    broker.refuse.store(true, Ordering::SeqCst);
    configure(&channel, "tok");

    let (a, b) = tokio::join!(channel.ensure_connected(), channel.ensure_connected());

    for result in [a, b] {
        let err = result.unwrap_err();
        assert!(err.is_auth_expired(), "got {err:?}");
    }
    assert_eq!(broker.connects.load(Ordering::SeqCst), 1);
    assert!(!channel.is_connected());

    // A failed attempt is not cached.
    broker.refuse.store(false, Ordering::SeqCst);
    channel.ensure_connected().await.unwrap();
    assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let (broker, channel) = setup_with_timeout(Duration::from_secs(2));
    *broker.connect_delay.lock().unwrap() = Duration::from_secs(60);
    configure(&channel, "tok");

    let err = channel.ensure_connected().await.unwrap_err();

    match err {
        Error::ConnectFailed(inner) => {
            assert!(matches!(*inner, Error::ConnectTimeout { timeout_secs: 2 }), "got {inner:?}");
        }
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn test_disconnect_resets_everything() {
    let (broker, channel) = setup();
    configure(&channel, "tok");
    channel.ensure_connected().await.unwrap();
    channel.subscribe_topic("accounts/1/entities").await.unwrap();
    channel.subscribe_topic("accounts/1/dashboards").await.unwrap();

    channel.disconnect().await;

    assert!(!channel.is_connected());
    assert!(channel.tracked_topics().await.is_empty());
    let log = broker.log();
    assert!(log.contains(&"unsub changed/accounts/1/entities".to_owned()));
    assert!(log.contains(&"unsub changed/accounts/1/dashboards".to_owned()));
    assert_eq!(log.last().map(String::as_str), Some("close"));

    // Parameters are forgotten too.
    assert!(matches!(channel.ensure_connected().await, Err(Error::NotConfigured)));

    configure(&channel, "tok-2");
    channel.ensure_connected().await.unwrap();
    assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disconnect_bumps_epoch() {
    let (_broker, channel) = setup();
    let mut disconnects = channel.disconnects();
    assert_eq!(channel.disconnect_epoch(), 0);

    configure(&channel, "tok");
    channel.ensure_connected().await.unwrap();
    assert!(!disconnects.has_changed().unwrap());

    channel.disconnect().await;
    assert!(disconnects.has_changed().unwrap());
    assert_eq!(*disconnects.borrow_and_update(), 1);
    assert_eq!(channel.disconnect_epoch(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_handshake_discards_session() {
    let (broker, channel) = setup();
    *broker.connect_delay.lock().unwrap() = Duration::from_secs(1);
    configure(&channel, "tok");

    let pending = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.ensure_connected().await })
    };
    while broker.connects.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    channel.disconnect().await;
    let result = pending.await.unwrap();

    assert!(result.is_err());
    assert!(!channel.is_connected());
    assert_eq!(broker.log(), vec!["close".to_owned()]);
}

#[tokio::test]
async fn test_dead_session_is_replaced_and_topics_restored() {
    let (broker, channel) = setup();
    configure(&channel, "tok");
    channel.ensure_connected().await.unwrap();
    channel.subscribe_topic("accounts/1/entities").await.unwrap();

    broker.alive.store(false, Ordering::SeqCst);
    channel.ensure_connected().await.unwrap();

    assert_eq!(broker.connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        broker.log(),
        vec![
            "sub changed/accounts/1/entities".to_owned(),
            "sub changed/accounts/1/entities".to_owned(),
        ]
    );
    assert_eq!(channel.tracked_topics().await, vec!["accounts/1/entities".to_owned()]);
}

// ── Topic reference counting ────────────────────────────────────────

#[tokio::test]
async fn test_topics_are_reference_counted() {
    let (broker, channel) = setup();
    configure(&channel, "tok");
    channel.ensure_connected().await.unwrap();

    channel.subscribe_topic("accounts/1/entities").await.unwrap();
    channel.subscribe_topic("accounts/1/entities").await.unwrap();
    assert_eq!(broker.log(), vec!["sub changed/accounts/1/entities".to_owned()]);

    channel.unsubscribe_topic("accounts/1/entities").await.unwrap();
    assert_eq!(broker.log().len(), 1, "still referenced once");
    assert_eq!(channel.tracked_topics().await, vec!["accounts/1/entities".to_owned()]);

    channel.unsubscribe_topic("accounts/1/entities").await.unwrap();
    assert_eq!(
        broker.log().last().map(String::as_str),
        Some("unsub changed/accounts/1/entities")
    );
    assert!(channel.tracked_topics().await.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_unknown_topic_is_noop() {
    let (broker, channel) = setup();
    configure(&channel, "tok");
    channel.ensure_connected().await.unwrap();

    channel.unsubscribe_topic("never/subscribed").await.unwrap();

    assert!(broker.log().is_empty());
}

#[tokio::test]
async fn test_subscribe_requires_connection() {
    let (_broker, channel) = setup();
    configure(&channel, "tok");

    let err = channel.subscribe_topic("accounts/1").await.unwrap_err();

    assert!(matches!(err, Error::NotConnected), "got {err:?}");
}

#[tokio::test]
async fn test_rejected_subscribe_is_not_tracked() {
    let (broker, channel) = setup();
    broker
        .rejected
        .lock()
        .unwrap()
        .insert("changed/forbidden".into());
    configure(&channel, "tok");
    channel.ensure_connected().await.unwrap();

    let err = channel.subscribe_topic("forbidden").await.unwrap_err();

    assert!(matches!(err, Error::SubscribeRejected { .. }), "got {err:?}");
    assert!(channel.tracked_topics().await.is_empty());
}

// ── Notifications ───────────────────────────────────────────────────

#[tokio::test]
async fn test_notifications_have_prefix_stripped() {
    let (broker, channel) = setup();
    configure(&channel, "tok");
    let mut rx = channel.notifications();
    channel.ensure_connected().await.unwrap();

    broker.publish("changed/accounts/1/entities", r#"{"id":7}"#);
    broker.publish("other/accounts/1", "ignored");

    let n = rx.recv().await.unwrap();
    assert_eq!(n.topic, "accounts/1/entities");
    assert_eq!(n.payload, r#"{"id":7}"#);
    assert!(rx.try_recv().is_err());
}
