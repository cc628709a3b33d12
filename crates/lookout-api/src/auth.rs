// Bearer token consumption and refresh
//
// The token lives in a session-scoped key-value store under a fixed key.
// Both the resource client and the change channel read it from there;
// the refresh flow writes the rotated token back to the same key.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::resource::endpoint_url;

/// Session storage key holding the current bearer token.
pub const TOKEN_STORAGE_KEY: &str = "grafolean_jwt_token";

/// Path (relative to the API root) of the token refresh endpoint.
pub const REFRESH_PATH: &str = "auth/refresh";

/// Response header carrying the rotated token.
pub const REFRESHED_TOKEN_HEADER: &str = "X-JWT-Token";

// ── Session storage ──────────────────────────────────────────────────

/// Session-scoped key-value store.
///
/// Lives exactly as long as the login session; cleared on logout.
pub trait SessionStorage: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// In-process [`SessionStorage`]. The process is the session.
#[derive(Default)]
pub struct MemorySessionStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemorySessionStorage {
    // Values are tokens; only show which keys are populated.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemorySessionStorage")
            .field("keys", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value);
    }

    fn remove(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

// ── CredentialProvider ───────────────────────────────────────────────

/// Supplies the current bearer token and refreshes it on demand.
///
/// At most one refresh request is ever outstanding: concurrent callers
/// that hit a 401 with the same stale token queue on `refresh_lock`, and
/// everyone after the first finds the rotated token already in storage.
pub struct CredentialProvider {
    http: reqwest::Client,
    refresh_url: Url,
    storage: Arc<dyn SessionStorage>,
    refresh_lock: Mutex<()>,
    /// Bumped whenever a new token is stored.
    rotations: watch::Sender<u64>,
}

impl CredentialProvider {
    pub fn new(
        http: reqwest::Client,
        api_root: &Url,
        storage: Arc<dyn SessionStorage>,
    ) -> Result<Self, Error> {
        Ok(Self {
            http,
            refresh_url: endpoint_url(api_root, REFRESH_PATH)?,
            storage,
            refresh_lock: Mutex::new(()),
            rotations: watch::Sender::new(0),
        })
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    /// The token currently in session storage, if any.
    pub fn token(&self) -> Option<SecretString> {
        self.storage.get(TOKEN_STORAGE_KEY).map(SecretString::from)
    }

    /// Like [`token`](Self::token) but fails with [`Error::NotAuthenticated`].
    pub fn require_token(&self) -> Result<SecretString, Error> {
        self.token().ok_or(Error::NotAuthenticated)
    }

    /// Store a token obtained out of band (login, config file, keyring).
    pub fn set_token(&self, token: &SecretString) {
        self.storage
            .set(TOKEN_STORAGE_KEY, token.expose_secret().to_owned());
        self.rotations.send_modify(|n| *n += 1);
    }

    /// Changes whenever a new token lands in storage (login or refresh).
    pub fn rotations(&self) -> watch::Receiver<u64> {
        self.rotations.subscribe()
    }

    /// Forget the token. Used on logout.
    pub fn clear(&self) {
        self.storage.remove(TOKEN_STORAGE_KEY);
    }

    /// Exchange `stale` for a fresh token via `POST <root>/auth/refresh`.
    ///
    /// If another caller already rotated the token while we waited for the
    /// lock, the rotated token is returned without a second request.
    pub async fn refresh(&self, stale: &SecretString) -> Result<SecretString, Error> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.token() {
            if current.expose_secret() != stale.expose_secret() {
                debug!("token already refreshed by a concurrent request");
                return Ok(current);
            }
        }

        debug!("refreshing token at {}", self.refresh_url);

        let resp = self
            .http
            .post(self.refresh_url.clone())
            .bearer_auth(stale.expose_secret())
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "token refresh rejected");
            return Err(Error::Authentication {
                message: format!("token refresh failed (HTTP {status})"),
            });
        }

        let token = resp
            .headers()
            .get(REFRESHED_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| Error::Authentication {
                message: format!("refresh response carried no {REFRESHED_TOKEN_HEADER} header"),
            })?;

        self.storage.set(TOKEN_STORAGE_KEY, token.clone());
        self.rotations.send_modify(|n| *n += 1);
        debug!("token refreshed");
        Ok(SecretString::from(token))
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("refresh_url", &self.refresh_url.as_str())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}
