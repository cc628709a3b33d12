// ── Subscription registry ──
//
// Keeps many logical subscriptions fresh over one change channel.
//
// - `register` stores the record, asks the topic worker to attach it to its
//   effective topic, and starts the first fetch.
// - The dispatch task turns channel notifications into debounced
//   re-fetches for every matching subscription.
// - The topic worker owns "which subscriptions hold which broker topic" and
//   is the only caller of `subscribe_topic`/`unsubscribe_topic`, so topic
//   operations run one at a time, in issue order.
//
// Each fetch carries a generation number. A result is applied only if the
// record is still registered and the generation is still current, so an
// unregistered or superseded fetch never reaches a callback. Results are
// applied under a per-entry lock that retiring an entry also takes.
//
// A channel `disconnect` drops every broker topic. Subscriptions registered
// before it end with a terminal error and the topic worker forgets its
// holders, so the next registration on a topic subscribes afresh.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use lookout_api::changes::ChangeNotification;
use lookout_api::{ChangeChannel, FetchOptions, QueryParams, ResourceClient};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::debounce::Debouncer;
use crate::error::SubscriptionError;
use crate::subscription::{
    ErrorCallback, FetchStartCallback, NotificationFilter, SubscriptionId, SubscriptionSpec,
    UpdateCallback,
};
use crate::topic::TopicPattern;

const AUTH_CHANNEL_CAPACITY: usize = 16;

// ── Registry ─────────────────────────────────────────────────────

/// The subscription registry.
///
/// Cheaply cloneable via `Arc<RegistryInner>`. Must be created inside a
/// tokio runtime: it spawns its dispatch and topic worker tasks.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    client: Arc<ResourceClient>,
    channel: ChangeChannel,
    debounce: Duration,
    entries: DashMap<SubscriptionId, Arc<Entry>>,
    next_id: AtomicU64,
    topic_tx: mpsc::UnboundedSender<TopicCommand>,
    /// Auth failures seen by fetches; the session listens.
    auth_failures: broadcast::Sender<String>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One live subscription.
struct Entry {
    id: SubscriptionId,
    resource: String,
    query: QueryParams,
    topic: TopicPattern,
    filter: NotificationFilter,
    fetch_options: FetchOptions,
    on_update: UpdateCallback,
    on_error: ErrorCallback,
    on_fetch_start: Option<FetchStartCallback>,
    debouncer: Debouncer,
    /// Channel disconnect epoch at registration.
    channel_epoch: u64,
    fetch: Mutex<FetchSlot>,
    /// Held while a fetch result is handed to a callback.
    apply: Mutex<()>,
}

#[derive(Default)]
struct FetchSlot {
    alive: bool,
    generation: u64,
    in_flight: Option<CancellationToken>,
    /// Thread running a result callback, if any.
    applying_on: Option<ThreadId>,
}

impl Entry {
    /// Supersede whatever is in flight and claim a new generation.
    fn begin_fetch(&self) -> Option<(u64, CancellationToken)> {
        let mut slot = self.fetch.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.alive {
            return None;
        }
        if let Some(previous) = slot.in_flight.take() {
            trace!(subscription = %self.id, "superseding in-flight fetch");
            previous.cancel();
        }
        slot.generation += 1;
        let token = CancellationToken::new();
        slot.in_flight = Some(token.clone());
        Some((slot.generation, token))
    }

    /// `true` if `generation` is still the one to apply; clears the slot.
    /// Call with `apply` held.
    fn finish_fetch(&self, generation: u64) -> bool {
        let mut slot = self.fetch.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.alive || slot.generation != generation {
            return false;
        }
        slot.in_flight = None;
        slot.applying_on = Some(thread::current().id());
        true
    }

    fn done_applying(&self) {
        self.fetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .applying_on = None;
    }

    /// Mark dead and stop all pending work. Returns `false` if already dead.
    ///
    /// Waits for a result callback running on another thread. A callback
    /// retiring its own entry does not wait.
    fn retire(&self) -> bool {
        let (was_alive, reentrant) = {
            let mut slot = self.fetch.lock().unwrap_or_else(PoisonError::into_inner);
            let was_alive = slot.alive;
            slot.alive = false;
            if let Some(token) = slot.in_flight.take() {
                token.cancel();
            }
            (was_alive, slot.applying_on == Some(thread::current().id()))
        };
        self.debouncer.cancel();
        if !reentrant {
            drop(self.apply.lock().unwrap_or_else(PoisonError::into_inner));
        }
        was_alive
    }
}

enum TopicCommand {
    Attach { topic: String, id: SubscriptionId },
    Detach { topic: String, id: SubscriptionId },
}

impl Registry {
    pub fn new(client: Arc<ResourceClient>, channel: ChangeChannel, debounce: Duration) -> Self {
        let (topic_tx, topic_rx) = mpsc::unbounded_channel();
        let (auth_failures, _) = broadcast::channel(AUTH_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let inner = Arc::new(RegistryInner {
            client,
            channel: channel.clone(),
            debounce,
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            topic_tx,
            auth_failures,
            cancel: cancel.clone(),
            task_handles: Mutex::new(Vec::new()),
        });

        let handles = vec![
            tokio::spawn(topic_worker(
                Arc::downgrade(&inner),
                channel.clone(),
                topic_rx,
                cancel.clone(),
            )),
            tokio::spawn(dispatch_task(
                Arc::downgrade(&inner),
                channel.notifications(),
                cancel,
            )),
        ];
        *inner
            .task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handles;

        Self { inner }
    }

    // ── Registration ─────────────────────────────────────────────

    /// Register a subscription. Returns immediately; the first fetch and
    /// the topic subscription happen in the background.
    pub fn register(&self, spec: SubscriptionSpec) -> SubscriptionId {
        let id = SubscriptionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let topic = spec.topic_pattern();
        let channel_epoch = self.inner.channel.disconnect_epoch();

        let entry = Arc::new(Entry {
            id,
            resource: spec.resource,
            query: spec.query,
            topic,
            filter: spec.filter,
            fetch_options: spec.fetch_options,
            on_update: spec.on_update,
            on_error: spec.on_error,
            on_fetch_start: spec.on_fetch_start,
            debouncer: Debouncer::new(self.inner.debounce),
            channel_epoch,
            fetch: Mutex::new(FetchSlot {
                alive: true,
                ..FetchSlot::default()
            }),
            apply: Mutex::new(()),
        });

        debug!(
            subscription = %id,
            resource = %entry.resource,
            topic = %entry.topic,
            "registering subscription"
        );

        let topic = entry.topic.as_str().to_owned();
        self.inner.entries.insert(id, entry);
        let _ = self.inner.topic_tx.send(TopicCommand::Attach { topic, id });
        self.inner.start_fetch(id);

        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    ///
    /// No callback for `id` runs after this returns, except when called from
    /// inside that subscription's own callback.
    pub fn unregister(&self, id: SubscriptionId) {
        let Some((_, entry)) = self.inner.entries.remove(&id) else {
            trace!(subscription = %id, "unregister for unknown subscription");
            return;
        };
        entry.retire();

        debug!(subscription = %id, "unregistered subscription");
        let _ = self.inner.topic_tx.send(TopicCommand::Detach {
            topic: entry.topic.as_str().to_owned(),
            id,
        });
    }

    /// Fetch now, skipping the debounce window and superseding any fetch in
    /// flight. Returns `false` for unknown ids.
    pub fn refresh(&self, id: SubscriptionId) -> bool {
        let Some(entry) = self.inner.entry(id) else {
            return false;
        };
        entry.debouncer.cancel();
        self.inner.start_fetch(id);
        true
    }

    /// Drop every subscription without reporting anything.
    pub fn clear(&self) {
        for id in self.ids() {
            self.unregister(id);
        }
    }

    /// End every subscription with a terminal error.
    pub fn fail_all(&self, message: &str) {
        for id in self.ids() {
            if let Some(entry) = self.inner.remove_entry(id) {
                let _ = self.inner.topic_tx.send(TopicCommand::Detach {
                    topic: entry.topic.as_str().to_owned(),
                    id,
                });
                (entry.on_error)(&SubscriptionError::terminal(message));
            }
        }
    }

    /// Stop the background tasks and drop all subscriptions silently.
    pub async fn shutdown(&self) {
        self.clear();
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.inner.entries.contains_key(&id)
    }

    /// Authentication failures from fetches, as messages.
    ///
    /// While at least one receiver exists, auth failures are reported here
    /// instead of to the subscription's error callback.
    pub fn auth_failures(&self) -> broadcast::Receiver<String> {
        self.inner.auth_failures.subscribe()
    }

    pub fn channel(&self) -> &ChangeChannel {
        &self.inner.channel
    }

    fn ids(&self) -> Vec<SubscriptionId> {
        self.inner.entries.iter().map(|e| *e.key()).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("subscriptions", &self.len())
            .field("debounce", &self.inner.debounce)
            .finish_non_exhaustive()
    }
}

// ── Fetching ─────────────────────────────────────────────────────

impl RegistryInner {
    fn entry(&self, id: SubscriptionId) -> Option<Arc<Entry>> {
        self.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    fn remove_entry(&self, id: SubscriptionId) -> Option<Arc<Entry>> {
        let (_, entry) = self.entries.remove(&id)?;
        entry.retire().then_some(entry)
    }

    fn start_fetch(self: &Arc<Self>, id: SubscriptionId) {
        let Some(entry) = self.entry(id) else {
            return;
        };
        let Some((generation, cancel)) = entry.begin_fetch() else {
            return;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.perform_fetch(&entry, generation, cancel).await });
    }

    async fn perform_fetch(&self, entry: &Entry, generation: u64, cancel: CancellationToken) {
        if let Some(on_fetch_start) = &entry.on_fetch_start {
            on_fetch_start(entry.id);
        }

        let result = self
            .client
            .get_json(&entry.resource, &entry.query, &entry.fetch_options, &cancel)
            .await;

        let _applying = entry.apply.lock().unwrap_or_else(PoisonError::into_inner);
        if !entry.finish_fetch(generation) {
            trace!(subscription = %entry.id, generation, "dropping stale fetch result");
            return;
        }

        match result {
            Ok(value) => {
                trace!(subscription = %entry.id, resource = %entry.resource, "fetch complete");
                (entry.on_update)(value, entry.id);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) if e.is_auth_expired() => {
                warn!(subscription = %entry.id, error = %e, "authentication failed during fetch");
                if self.auth_failures.send(e.to_string()).is_err() {
                    // Nobody owns the session; report it like any other failure.
                    (entry.on_error)(&SubscriptionError::transient(e.to_string()));
                }
            }
            Err(e) => {
                debug!(subscription = %entry.id, error = %e, "fetch failed");
                (entry.on_error)(&SubscriptionError::transient(e.to_string()));
            }
        }
        entry.done_applying();
    }

    // ── Notifications ────────────────────────────────────────────

    fn on_channel_message(self: &Arc<Self>, notification: &ChangeNotification) {
        let payload: Value = serde_json::from_str(&notification.payload)
            .unwrap_or_else(|_| Value::String(notification.payload.clone()));

        // Collect first so no map shard is locked while predicates run.
        let matching: Vec<Arc<Entry>> = self
            .entries
            .iter()
            .filter(|e| e.topic.matches(&notification.topic))
            .map(|e| Arc::clone(e.value()))
            .collect();

        trace!(
            topic = %notification.topic,
            matches = matching.len(),
            "change notification"
        );

        for entry in matching {
            if !entry.filter.wants(&payload, &notification.topic) {
                trace!(subscription = %entry.id, "predicate declined re-fetch");
                continue;
            }
            self.schedule_refetch(&entry);
        }
    }

    fn schedule_refetch(self: &Arc<Self>, entry: &Entry) {
        let weak = Arc::downgrade(self);
        let id = entry.id;
        entry.debouncer.schedule(move || {
            if let Some(inner) = weak.upgrade() {
                inner.start_fetch(id);
            }
        });
    }

    /// Notifications were lost; assume everything changed.
    fn schedule_refetch_all(self: &Arc<Self>) {
        let entries: Vec<Arc<Entry>> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            self.schedule_refetch(&entry);
        }
    }

    // ── Topic failures ───────────────────────────────────────────

    /// Subscriptions registered before the channel's `epoch`-th disconnect
    /// lost their broker topic.
    fn fail_disconnected(&self, epoch: u64) {
        let ids: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|e| e.channel_epoch < epoch)
            .map(|e| *e.key())
            .collect();

        for id in ids {
            if let Some(entry) = self.remove_entry(id) {
                warn!(subscription = %id, "subscription ended: change channel disconnected");
                (entry.on_error)(&SubscriptionError::terminal("change channel disconnected"));
            }
        }
    }

    /// The broker would not give us `topic`: every subscription on it ends.
    fn fail_topic(&self, topic: &str, message: &str) {
        let ids: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|e| e.topic.as_str() == topic)
            .map(|e| *e.key())
            .collect();

        for id in ids {
            if let Some(entry) = self.remove_entry(id) {
                warn!(subscription = %id, topic, "subscription ended: {message}");
                (entry.on_error)(&SubscriptionError::terminal(message));
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Sole owner of topic holder sets; serializes channel topic operations.
async fn topic_worker(
    registry: Weak<RegistryInner>,
    channel: ChangeChannel,
    mut rx: mpsc::UnboundedReceiver<TopicCommand>,
    cancel: CancellationToken,
) {
    let mut holders: HashMap<String, HashSet<SubscriptionId>> = HashMap::new();
    let mut disconnects = channel.disconnects();
    let mut seen_epoch = *disconnects.borrow_and_update();

    loop {
        let cmd = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = disconnects.changed() => {
                if changed.is_err() {
                    break;
                }
                None
            }
            cmd = rx.recv() => match cmd {
                Some(cmd) => Some(cmd),
                None => break,
            },
        };

        // Checked before every command so an attach issued after a
        // disconnect never counts a holder from before it.
        let epoch = *disconnects.borrow_and_update();
        if epoch != seen_epoch {
            seen_epoch = epoch;
            debug!(epoch, "change channel disconnected, dropping topic holders");
            holders.clear();
            let Some(inner) = registry.upgrade() else { break };
            inner.fail_disconnected(epoch);
        }

        let Some(cmd) = cmd else { continue };
        match cmd {
            TopicCommand::Attach { topic, id } => {
                let Some(inner) = registry.upgrade() else { break };
                // Force-unregistered while queued.
                if !inner.entries.contains_key(&id) {
                    continue;
                }
                drop(inner);

                let holders_of = holders.entry(topic.clone()).or_default();
                let first = holders_of.is_empty();
                holders_of.insert(id);
                if !first {
                    continue;
                }

                let result = async {
                    channel.ensure_connected().await?;
                    channel.subscribe_topic(&topic).await
                }
                .await;

                if let Err(e) = result {
                    holders.remove(&topic);
                    let Some(inner) = registry.upgrade() else { break };
                    if e.is_auth_expired() {
                        let _ = inner.auth_failures.send(e.to_string());
                    }
                    inner.fail_topic(&topic, &e.to_string());
                }
            }
            TopicCommand::Detach { topic, id } => {
                let Some(holders_of) = holders.get_mut(&topic) else {
                    continue;
                };
                holders_of.remove(&id);
                if !holders_of.is_empty() {
                    continue;
                }
                holders.remove(&topic);
                if let Err(e) = channel.unsubscribe_topic(&topic).await {
                    warn!(topic, error = %e, "topic unsubscribe failed");
                }
            }
        }
    }

    debug!("topic worker exiting");
}

/// Feed channel notifications into the registry.
async fn dispatch_task(
    registry: Weak<RegistryInner>,
    mut rx: broadcast::Receiver<Arc<ChangeNotification>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Ok(notification) => {
                    let Some(inner) = registry.upgrade() else { break };
                    inner.on_channel_message(&notification);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification dispatch lagged, re-fetching everything");
                    let Some(inner) = registry.upgrade() else { break };
                    inner.schedule_refetch_all();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    debug!("notification dispatch exiting");
}
