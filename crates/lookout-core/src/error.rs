// ── Core error types ──
//
// What session-level callers see. Wire details (MQTT return codes, raw
// reqwest errors) are folded into a handful of domain variants by the
// `From<lookout_api::Error>` impl. Subscription callbacks get the smaller
// `SubscriptionError` instead.

use std::fmt;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to change broker: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Not connected")]
    NotConnected,

    // ── Subscription errors ──────────────────────────────────────────
    #[error("Broker rejected subscription to '{topic}'")]
    SubscriptionRejected { topic: String },

    // ── Resource errors ──────────────────────────────────────────────
    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("Unexpected response: {message}")]
    InvalidResponse { message: String },

    #[error("Request cancelled")]
    Cancelled,

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<lookout_api::Error> for CoreError {
    fn from(err: lookout_api::Error) -> Self {
        use lookout_api::Error as Api;

        if err.is_auth_expired() {
            return CoreError::AuthenticationFailed {
                message: auth_message(&err),
            };
        }

        match err {
            Api::Transport(ref e) if e.is_timeout() => CoreError::Timeout { timeout_secs: 0 },
            Api::Transport(e) => CoreError::ConnectionFailed {
                reason: e.to_string(),
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::InvalidHeader(message) => CoreError::Config {
                message: format!("Invalid header {message}"),
            },
            Api::Tls(msg) => CoreError::Config {
                message: format!("TLS error: {msg}"),
            },
            Api::Cancelled => CoreError::Cancelled,
            Api::Http {
                status,
                status_text,
            } => CoreError::Http {
                status,
                message: status_text,
            },
            Api::Deserialization { message, body: _ } => CoreError::InvalidResponse { message },
            Api::ConnectTimeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::SubscribeRejected { topic } => CoreError::SubscriptionRejected { topic },
            Api::NotConnected => CoreError::NotConnected,
            Api::NotConfigured => CoreError::Config {
                message: "change channel used before it was configured".into(),
            },
            Api::ConnectFailed(inner) => match std::sync::Arc::try_unwrap(inner) {
                Ok(inner) => CoreError::from(inner),
                Err(shared) => CoreError::ConnectionFailed {
                    reason: shared.to_string(),
                },
            },
            other @ (Api::WebSocketConnect(_)
            | Api::WebSocketClosed { .. }
            | Api::Protocol(_)
            | Api::ConnectionRefused { .. }) => CoreError::ConnectionFailed {
                reason: other.to_string(),
            },
            other => CoreError::Internal(other.to_string()),
        }
    }
}

fn auth_message(err: &lookout_api::Error) -> String {
    match err {
        lookout_api::Error::Authentication { message } => message.clone(),
        lookout_api::Error::ConnectFailed(inner) => auth_message(inner),
        other => other.to_string(),
    }
}

// ── SubscriptionError ────────────────────────────────────────────────

/// What a subscription's error callback receives.
///
/// `terminal` means the subscription has already been removed from the
/// registry; the caller has to register again to resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionError {
    pub message: String,
    pub terminal: bool,
}

impl SubscriptionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
        }
    }
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terminal {
            write!(f, "{} (subscription ended)", self.message)
        } else {
            f.write_str(&self.message)
        }
    }
}

impl std::error::Error for SubscriptionError {}
