// Shared fixtures: an in-memory broker behind `BrokerConnector`, a wiremock
// backend, and a recorder for subscription callbacks.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::watch;
use wiremock::MockServer;

use lookout_api::auth::TOKEN_STORAGE_KEY;
use lookout_api::changes::NotificationSink;
use lookout_api::{
    BrokerConnector, BrokerParams, BrokerSession, ChangeChannel, CredentialProvider, Error,
    MemorySessionStorage, ResourceClient, SessionStorage, TransportConfig,
};
use lookout_core::{
    BrokerConfig, Registry, SubscriptionError, SubscriptionId, SubscriptionSpec, SyncConfig,
};

// ── Fake broker ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBroker {
    pub connects: AtomicUsize,
    pub rejected: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
    sink: Mutex<Option<NotificationSink>>,
    params: Mutex<Option<watch::Receiver<Option<BrokerParams>>>>,
}

impl FakeBroker {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    /// Publish as the backend would: under `changed/`.
    pub fn publish(&self, topic: &str, payload: &str) {
        let sink = self.sink.lock().unwrap().clone().expect("not connected");
        sink.deliver(&format!("changed/{topic}"), payload.as_bytes());
    }

    /// The parameters a reconnect would use right now.
    pub fn current_params(&self) -> Option<BrokerParams> {
        self.params
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
    }

    pub fn reject(&self, topic: &str) {
        self.rejected.lock().unwrap().insert(format!("changed/{topic}"));
    }
}

pub struct FakeConnector(pub Arc<FakeBroker>);

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(
        &self,
        params: watch::Receiver<Option<BrokerParams>>,
        sink: NotificationSink,
    ) -> Result<Box<dyn BrokerSession>, Error> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        *self.0.sink.lock().unwrap() = Some(sink);
        *self.0.params.lock().unwrap() = Some(params);
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
        self.0.log.lock().unwrap().push(format!("sub {filter}"));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        self.0.log.lock().unwrap().push(format!("unsub {filter}"));
        Ok(())
    }

    async fn close(&self) {
        self.0.log.lock().unwrap().push("close".into());
    }
}

// ── Callback recorder ───────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct Recorder {
    pub updates: Arc<Mutex<Vec<(SubscriptionId, Value)>>>,
    pub errors: Arc<Mutex<Vec<SubscriptionError>>>,
    pub fetch_starts: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn spec(&self, resource: &str) -> SubscriptionSpec {
        let updates = self.updates.clone();
        let errors = self.errors.clone();
        let fetch_starts = self.fetch_starts.clone();
        SubscriptionSpec::new(
            resource,
            move |value, id| updates.lock().unwrap().push((id, value)),
            move |err| errors.lock().unwrap().push(err.clone()),
        )
        .on_fetch_start(move |_| {
            fetch_starts.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn updates(&self) -> Vec<Value> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn errors(&self) -> Vec<SubscriptionError> {
        self.errors.lock().unwrap().clone()
    }
}

// ── Setup ───────────────────────────────────────────────────────────

pub fn api_root(server: &MockServer) -> url::Url {
    format!("{}/api", server.uri()).parse().unwrap()
}

pub fn storage_with_token(token: Option<&str>) -> Arc<MemorySessionStorage> {
    let storage = Arc::new(MemorySessionStorage::new());
    if let Some(token) = token {
        storage.set(TOKEN_STORAGE_KEY, token.to_owned());
    }
    storage
}

pub struct RegistryFixture {
    pub server: MockServer,
    pub broker: Arc<FakeBroker>,
    pub channel: ChangeChannel,
    pub registry: Registry,
}

/// Registry over wiremock + fake broker, channel configured with "tok".
pub async fn registry_fixture(debounce: Duration) -> RegistryFixture {
    let server = MockServer::start().await;
    let root = api_root(&server);

    let http = TransportConfig::default().build_client().unwrap();
    let storage: Arc<dyn SessionStorage> = storage_with_token(Some("tok"));
    let credentials = Arc::new(CredentialProvider::new(http.clone(), &root, storage).unwrap());
    let client = Arc::new(ResourceClient::new(http, root, credentials));

    let broker = Arc::new(FakeBroker::default());
    let channel = ChangeChannel::new(Arc::new(FakeConnector(broker.clone())));
    channel.configure("broker.test", 9883, false, SecretString::from("tok"));

    let registry = Registry::new(client, channel.clone(), debounce);
    RegistryFixture {
        server,
        broker,
        channel,
        registry,
    }
}

pub fn sync_config(server: &MockServer, debounce: Duration) -> SyncConfig {
    let mut config = SyncConfig::new(
        api_root(server),
        BrokerConfig {
            host: "broker.test".into(),
            port: 9883,
            secure: false,
            path: "/mqtt".into(),
        },
    );
    config.debounce = debounce;
    config
}

/// Poll `cond` until it holds, for up to five seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// GET requests wiremock has seen for `path`.
pub async fn get_count(server: &MockServer, path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path() == path)
        .count()
}

/// Wait until wiremock has seen at least `n` GETs for `path`.
pub async fn wait_for_requests(server: &MockServer, path: &str, n: usize) {
    for _ in 0..500 {
        if get_count(server, path).await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {n} requests to {path}");
}
