use std::sync::Arc;

use thiserror::Error;

/// Top-level error type for the `lookout-api` crate.
///
/// Covers every failure mode across the wire-level clients:
/// authentication, HTTP transport, the resource API, and the MQTT
/// change-notification broker. `lookout-core` maps these into
/// subscription- and session-level diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Token refresh was rejected or returned no token.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// No token in session storage -- the session was never established
    /// or has been logged out.
    #[error("Not authenticated -- no token in session storage")]
    NotAuthenticated,

    /// The server still answered 401 after a successful token refresh.
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A caller-supplied header name or value is not valid HTTP.
    #[error("Invalid header {0}")]
    InvalidHeader(String),

    /// The request was cancelled by its owner (superseded or unregistered).
    #[error("Request cancelled")]
    Cancelled,

    // ── Resource API ────────────────────────────────────────────────
    /// Non-2xx response other than a handled 401.
    #[error("{status_text}")]
    Http { status: u16, status_text: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Broker ──────────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// Malformed or unexpected MQTT packet.
    #[error("MQTT protocol error: {0}")]
    Protocol(String),

    /// The broker handshake did not complete in time.
    #[error("Broker connection timed out after {timeout_secs}s")]
    ConnectTimeout { timeout_secs: u64 },

    /// The broker refused the CONNECT (non-zero CONNACK return code).
    #[error("Broker refused connection (return code {code})")]
    ConnectionRefused { code: u8 },

    /// The broker rejected a SUBSCRIBE (SUBACK failure code).
    #[error("Broker rejected subscription to '{topic}'")]
    SubscribeRejected { topic: String },

    /// A shared connection attempt failed. Every caller that was waiting
    /// on the same attempt receives the same underlying error.
    #[error("Broker connection failed: {0}")]
    ConnectFailed(#[source] Arc<Error>),

    /// `ensure_connected` called before `configure`.
    #[error("Change channel is not configured")]
    NotConfigured,

    /// Topic operation attempted without a live broker connection.
    #[error("Change channel is not connected")]
    NotConnected,
}

impl Error {
    /// Returns `true` if this error was caused by the owner cancelling
    /// the request rather than by the network or the server.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if this error indicates auth has expired and the
    /// whole session has to be re-established.
    ///
    /// A broker refusing CONNECT with "bad username or password" (4) or
    /// "not authorized" (5) counts: the token is the broker username.
    pub fn is_auth_expired(&self) -> bool {
        match self {
            Self::Authentication { .. } | Self::NotAuthenticated | Self::SessionExpired => true,
            Self::ConnectionRefused { code } => matches!(code, 4 | 5),
            Self::ConnectFailed(inner) => inner.is_auth_expired(),
            _ => false,
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } | Self::ConnectTimeout { .. } => {
                true
            }
            Self::Http { status, .. } => *status >= 500,
            Self::ConnectFailed(inner) => inner.is_transient(),
            _ => false,
        }
    }

    /// HTTP status code, if the error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
