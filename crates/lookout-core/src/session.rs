// ── Session orchestration ──
//
// Wires credential provider, resource client, change channel and registry
// together for one login session, and owns the session-level reactions:
// connect, logout, and terminal teardown on authentication failure.

use std::sync::Arc;

use lookout_api::mqtt::WsMqttConnector;
use lookout_api::{
    BrokerConnector, ChangeChannel, CredentialProvider, ResourceClient, SessionStorage,
};
use secrecy::SecretString;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::CoreError;
use crate::registry::Registry;

// ── SessionState ─────────────────────────────────────────────────

/// Session state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Ended by [`Session::logout`].
    LoggedOut,
    /// Ended by a connect or authentication failure.
    Failed,
}

// ── Session ──────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Does not connect on
/// construction; call [`connect()`](Self::connect).
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SyncConfig,
    credentials: Arc<CredentialProvider>,
    client: Arc<ResourceClient>,
    channel: ChangeChannel,
    registry: Registry,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Build a session speaking MQTT over WebSocket to the configured broker.
    pub fn new(config: SyncConfig, storage: Arc<dyn SessionStorage>) -> Result<Self, CoreError> {
        let connector = Arc::new(WsMqttConnector::new(config.mqtt_options()));
        Self::with_connector(config, storage, connector)
    }

    /// Build a session over an arbitrary broker transport.
    pub fn with_connector(
        config: SyncConfig,
        storage: Arc<dyn SessionStorage>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, CoreError> {
        let http = config.transport().build_client()?;
        let credentials = Arc::new(CredentialProvider::new(
            http.clone(),
            &config.api_root,
            storage,
        )?);
        let client = Arc::new(ResourceClient::new(
            http,
            config.api_root.clone(),
            Arc::clone(&credentials),
        ));
        let channel = ChangeChannel::with_connect_timeout(connector, config.connect_timeout);
        let registry = Registry::new(Arc::clone(&client), channel.clone(), config.debounce);
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                credentials,
                client,
                channel,
                registry,
                state,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn client(&self) -> &Arc<ResourceClient> {
        &self.inner.client
    }

    pub fn channel(&self) -> &ChangeChannel {
        &self.inner.channel
    }

    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        &self.inner.credentials
    }

    /// Subscribe to session state changes.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Put a token obtained elsewhere into session storage.
    pub fn set_token(&self, token: &SecretString) {
        self.inner.credentials.set_token(token);
    }

    /// Configure the change channel with the stored token and connect.
    ///
    /// Also starts the supervisor that reacts to authentication failures
    /// and token rotation.
    pub async fn connect(&self) -> Result<(), CoreError> {
        self.inner.state.send_replace(SessionState::Connecting);

        let token = match self.inner.credentials.require_token() {
            Ok(token) => token,
            Err(e) => {
                self.inner.state.send_replace(SessionState::Failed);
                return Err(e.into());
            }
        };

        let broker = &self.inner.config.broker;
        self.inner
            .channel
            .configure(broker.host.clone(), broker.port, broker.secure, token);

        if let Err(e) = self.inner.channel.ensure_connected().await {
            warn!(error = %e, "change channel connection failed");
            self.inner.state.send_replace(SessionState::Failed);
            return Err(e.into());
        }

        let mut handles = self.inner.task_handles.lock().await;
        if handles.is_empty() {
            handles.push(tokio::spawn(supervisor_task(
                self.clone(),
                self.inner.registry.auth_failures(),
                self.inner.credentials.rotations(),
                self.inner.cancel.clone(),
            )));
        }
        drop(handles);

        self.inner.state.send_replace(SessionState::Connected);
        info!(host = %broker.host, port = broker.port, "session connected");
        Ok(())
    }

    /// End the session: drop every subscription silently, disconnect the
    /// channel, forget the token.
    pub async fn logout(&self) {
        self.teardown().await;
        self.inner.state.send_replace(SessionState::LoggedOut);
        info!("logged out");
    }

    /// Stop background work without touching the stored token.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.registry.shutdown().await;
        self.inner.channel.disconnect().await;
        self.inner.state.send_replace(SessionState::Disconnected);
        debug!("session shut down");
    }

    async fn teardown(&self) {
        self.inner.registry.clear();
        self.inner.channel.disconnect().await;
        self.inner.credentials.clear();
    }

    /// Authentication is gone: every subscription ends with a terminal
    /// error, then the session logs out.
    async fn on_auth_failure(&self, message: &str) {
        warn!(%message, "authentication failed, ending session");
        self.inner.registry.fail_all(message);
        self.teardown().await;
        self.inner.state.send_replace(SessionState::Failed);
    }

    /// Push a rotated token to the channel so reconnects use it.
    fn on_token_rotated(&self) {
        let Some(token) = self.inner.credentials.token() else {
            return;
        };
        if !self.inner.channel.is_connected() {
            return;
        }
        let broker = &self.inner.config.broker;
        self.inner
            .channel
            .configure(broker.host.clone(), broker.port, broker.secure, token);
        debug!("change channel picked up rotated token");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("api_root", &self.inner.config.api_root.as_str())
            .field("state", &self.current_state())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn supervisor_task(
    session: Session,
    mut auth_failures: broadcast::Receiver<String>,
    mut rotations: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            failure = auth_failures.recv() => match failure {
                Ok(message) => session.on_auth_failure(&message).await,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = rotations.changed() => {
                if changed.is_err() {
                    break;
                }
                session.on_token_rotated();
            }
        }
    }

    debug!("session supervisor exiting");
}
