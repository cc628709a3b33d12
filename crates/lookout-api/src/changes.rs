//! Change-notification channel.
//!
//! One [`ChangeChannel`] owns the single broker connection for the whole
//! process and is shared by reference between every consumer. Its lifecycle
//! is explicit: [`configure`](ChangeChannel::configure) →
//! [`ensure_connected`](ChangeChannel::ensure_connected) →
//! [`disconnect`](ChangeChannel::disconnect).
//!
//! Topic subscriptions are reference counted: the broker only sees a
//! SUBSCRIBE for the first reference to a topic and an UNSUBSCRIBE for the
//! last. Topics are plain resource topics (`accounts/1/entities`); the
//! `changed/` prefix the backend publishes under is added on the way out and
//! stripped on the way in.
//!
//! The wire transport sits behind [`BrokerConnector`] / [`BrokerSession`]
//! so the channel semantics don't depend on MQTT-over-WebSocket specifics.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use secrecy::SecretString;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, trace, warn};

use crate::error::Error;

/// Prefix the backend publishes change events under.
pub const CHANGED_PREFIX: &str = "changed/";

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Connection parameters ────────────────────────────────────────────

/// Where and as whom to connect. The token is the MQTT username.
#[derive(Debug, Clone)]
pub struct BrokerParams {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub token: SecretString,
}

// ── Inbound notifications ────────────────────────────────────────────

/// A change event, topic already stripped of [`CHANGED_PREFIX`].
///
/// The payload stays a string: its shape is defined by whoever
/// subscribed, so parsing happens at dispatch.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Handed to the transport; turns raw broker messages into
/// [`ChangeNotification`]s on the channel's broadcast.
#[derive(Clone)]
pub struct NotificationSink {
    tx: broadcast::Sender<Arc<ChangeNotification>>,
}

impl NotificationSink {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Deliver one raw broker message. Messages outside `changed/` are dropped.
    pub fn deliver(&self, raw_topic: &str, payload: &[u8]) {
        let Some(topic) = raw_topic.strip_prefix(CHANGED_PREFIX) else {
            trace!(topic = raw_topic, "ignoring message outside changed/ namespace");
            return;
        };

        let notification = ChangeNotification {
            topic: topic.to_owned(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            received_at: Utc::now(),
        };

        // Ignore send errors -- just means no active receivers right now
        let _ = self.tx.send(Arc::new(notification));
    }
}

impl fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSink")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

// ── Transport seam ───────────────────────────────────────────────────

/// Opens broker sessions.
///
/// `params` always reflects the latest [`ChangeChannel::configure`] call, so
/// a session that reconnects on its own picks up a rotated token. `None`
/// means the channel was torn down and the session should stop.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        params: watch::Receiver<Option<BrokerParams>>,
        sink: NotificationSink,
    ) -> Result<Box<dyn BrokerSession>, Error>;
}

/// A live broker session. Filters are full broker topics (`changed/...`).
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), Error>;
    async fn unsubscribe(&self, filter: &str) -> Result<(), Error>;
    async fn close(&self);

    /// `false` once the session has given up reconnecting.
    fn is_alive(&self) -> bool {
        true
    }
}

// ── ChangeChannel ────────────────────────────────────────────────────

type PendingConnect = Shared<BoxFuture<'static, Result<(), Arc<Error>>>>;

/// The process-wide change-notification channel.
///
/// Cheaply cloneable via `Arc<ChannelInner>`.
#[derive(Clone)]
pub struct ChangeChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    connector: Arc<dyn BrokerConnector>,
    connect_timeout: Duration,
    params: watch::Sender<Option<BrokerParams>>,
    /// Held across transport calls: single writer for session + topics.
    state: Mutex<ChannelState>,
    /// The in-flight connection attempt, shared by every concurrent caller.
    pending: std::sync::Mutex<Option<PendingConnect>>,
    /// Bumped by `disconnect`. A handshake that straddles it is discarded,
    /// and topic holders outside the channel watch it to drop stale state.
    epoch: watch::Sender<u64>,
    connected: AtomicBool,
    sink: NotificationSink,
}

#[derive(Default)]
struct ChannelState {
    session: Option<Box<dyn BrokerSession>>,
    /// topic → number of references.
    topics: HashMap<String, usize>,
}

impl ChangeChannel {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self::with_connect_timeout(connector, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connector: Arc<dyn BrokerConnector>, connect_timeout: Duration) -> Self {
        let (params, _) = watch::channel(None);
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                connect_timeout,
                params,
                state: Mutex::new(ChannelState::default()),
                pending: std::sync::Mutex::new(None),
                epoch: watch::channel(0).0,
                connected: AtomicBool::new(false),
                sink: NotificationSink::new(),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Store connection parameters. Does not connect.
    ///
    /// Calling again while connected only affects the next (re)connect.
    pub fn configure(&self, host: impl Into<String>, port: u16, secure: bool, token: SecretString) {
        let host = host.into();
        debug!(%host, port, secure, "change channel configured");
        self.inner.params.send_replace(Some(BrokerParams {
            host,
            port,
            secure,
            token,
        }));
    }

    /// Connect if not connected yet.
    ///
    /// Concurrent callers share one attempt and all observe its outcome.
    /// The attempt is bounded by the connect timeout.
    pub async fn ensure_connected(&self) -> Result<(), Error> {
        if self.is_connected() {
            let mut state = self.inner.state.lock().await;
            if state.session.as_ref().is_some_and(|s| s.is_alive()) {
                return Ok(());
            }
            // The session gave up reconnecting; topics stay tracked and are
            // restored by the next attempt.
            warn!("broker session is gone, reconnecting");
            state.session = None;
            self.inner.connected.store(false, Ordering::SeqCst);
        }

        let attempt = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(attempt) = pending.as_ref() {
                trace!("joining in-flight broker connection attempt");
                attempt.clone()
            } else {
                if self.inner.params.borrow().is_none() {
                    return Err(Error::NotConfigured);
                }
                let epoch = *self.inner.epoch.borrow();
                let attempt = connect_attempt(Arc::clone(&self.inner), epoch)
                    .boxed()
                    .shared();
                *pending = Some(attempt.clone());
                attempt
            }
        };

        attempt.await.map_err(Error::ConnectFailed)
    }

    /// Unsubscribe everything, close the transport, forget all state.
    ///
    /// A later `configure` + `ensure_connected` starts from scratch.
    pub async fn disconnect(&self) {
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.epoch.send_modify(|epoch| *epoch += 1);
            *pending = None;
        }

        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.session.take() {
            for topic in state.topics.keys() {
                if let Err(e) = session.unsubscribe(&broker_filter(topic)).await {
                    debug!(error = %e, topic, "unsubscribe during disconnect failed");
                }
            }
            session.close().await;
        }
        state.topics.clear();
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.params.send_replace(None);

        info!("change channel disconnected");
    }

    // ── Topics ───────────────────────────────────────────────────

    /// Add a reference to `topic`; the broker only hears about the first.
    pub async fn subscribe_topic(&self, topic: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;

        if let Some(count) = state.topics.get_mut(topic) {
            *count += 1;
            trace!(topic, refs = *count, "topic already subscribed");
            return Ok(());
        }

        let session = state.session.as_ref().ok_or(Error::NotConnected)?;
        session.subscribe(&broker_filter(topic)).await?;
        state.topics.insert(topic.to_owned(), 1);

        debug!(topic, "subscribed to topic");
        Ok(())
    }

    /// Drop a reference to `topic`; the broker only hears about the last.
    /// Unknown topics are a no-op.
    pub async fn unsubscribe_topic(&self, topic: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;

        let Some(count) = state.topics.get_mut(topic) else {
            trace!(topic, "unsubscribe for untracked topic ignored");
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            trace!(topic, refs = *count, "topic still referenced");
            return Ok(());
        }
        state.topics.remove(topic);

        if let Some(session) = state.session.as_ref() {
            session.unsubscribe(&broker_filter(topic)).await?;
        }

        debug!(topic, "unsubscribed from topic");
        Ok(())
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Topics currently subscribed at the broker, sorted.
    pub async fn tracked_topics(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut topics: Vec<String> = state.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of `disconnect` calls so far.
    pub fn disconnect_epoch(&self) -> u64 {
        *self.inner.epoch.borrow()
    }

    /// Changes whenever `disconnect` runs. Topic references taken before
    /// that are gone, so whoever holds them must start over.
    pub fn disconnects(&self) -> watch::Receiver<u64> {
        self.inner.epoch.subscribe()
    }

    /// A new receiver for inbound change notifications.
    ///
    /// Receivers survive `disconnect`/reconnect cycles.
    pub fn notifications(&self) -> broadcast::Receiver<Arc<ChangeNotification>> {
        self.inner.sink.tx.subscribe()
    }
}

impl fmt::Debug for ChangeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeChannel")
            .field("connected", &self.is_connected())
            .field("connect_timeout", &self.inner.connect_timeout)
            .finish_non_exhaustive()
    }
}

fn broker_filter(topic: &str) -> String {
    format!("{CHANGED_PREFIX}{topic}")
}

/// One connection attempt. Runs at most once per `pending` slot.
async fn connect_attempt(inner: Arc<ChannelInner>, epoch: u64) -> Result<(), Arc<Error>> {
    info!("connecting to change broker");

    let connect = inner
        .connector
        .connect(inner.params.subscribe(), inner.sink.clone());

    let outcome = match tokio::time::timeout(inner.connect_timeout, connect).await {
        Ok(Ok(session)) => {
            let mut state = inner.state.lock().await;
            if *inner.epoch.borrow() == epoch {
                for topic in state.topics.keys() {
                    if let Err(e) = session.subscribe(&broker_filter(topic)).await {
                        warn!(error = %e, topic, "failed to restore topic subscription");
                    }
                }
                state.session = Some(session);
                inner.connected.store(true, Ordering::SeqCst);
                info!("change broker connected");
                Ok(())
            } else {
                drop(state);
                debug!("channel disconnected during handshake, discarding session");
                session.close().await;
                Err(Arc::new(Error::NotConfigured))
            }
        }
        Ok(Err(e)) => {
            warn!(error = %e, "change broker connection failed");
            Err(Arc::new(e))
        }
        Err(_) => {
            warn!(
                timeout_secs = inner.connect_timeout.as_secs(),
                "change broker connection timed out"
            );
            Err(Arc::new(Error::ConnectTimeout {
                timeout_secs: inner.connect_timeout.as_secs(),
            }))
        }
    };

    let mut pending = inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
    if *inner.epoch.borrow() == epoch {
        *pending = None;
    }

    outcome
}
