//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use lookout_config::ConfigError;
use lookout_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not reach {target}")]
    #[diagnostic(
        code(lookout::connection_failed),
        help("Check that the API and broker are reachable.\n{reason}")
    )]
    ConnectionFailed { target: String, reason: String },

    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(lookout::timeout),
        help("Increase the timeout with --timeout or check backend responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── Authentication ───────────────────────────────────────────────

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(lookout::auth_failed),
        help(
            "The token was rejected and could not be refreshed.\n\
             Store a new one with: lookout config set-token"
        )
    )]
    AuthFailed { message: String },

    #[error("No token configured for profile '{profile}'")]
    #[diagnostic(
        code(lookout::no_token),
        help(
            "Store one with: lookout config set-token\n\
             Or pass --token / set LOOKOUT_TOKEN."
        )
    )]
    NoToken { profile: String },

    // ── Resources ────────────────────────────────────────────────────

    #[error("Resource not found: {message}")]
    #[diagnostic(code(lookout::not_found))]
    NotFound { message: String },

    #[error("API error ({status}): {message}")]
    #[diagnostic(code(lookout::api_error))]
    Api { status: u16, message: String },

    #[error("Unexpected response: {message}")]
    #[diagnostic(code(lookout::invalid_response))]
    InvalidResponse { message: String },

    #[error("Watch ended: {message}")]
    #[diagnostic(
        code(lookout::subscription_ended),
        help("Every subscription was ended by the backend. Re-run to subscribe again.")
    )]
    SubscriptionEnded { message: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(lookout::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(lookout::profile_not_found),
        help("Available profiles: {available}")
    )]
    ProfileNotFound { name: String, available: String },

    #[error("No profile configured")]
    #[diagnostic(
        code(lookout::no_config),
        help(
            "Pass --api-root, or add a profile to the config file.\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error("{message}")]
    #[diagnostic(code(lookout::config))]
    Config { message: String },

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(lookout::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render YAML: {0}")]
    #[diagnostic(code(lookout::yaml))]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoToken { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { reason } => CliError::ConnectionFailed {
                target: "change broker".into(),
                reason,
            },
            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },
            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },
            CoreError::NotConnected => CliError::ConnectionFailed {
                target: "change broker".into(),
                reason: "not connected".into(),
            },
            CoreError::SubscriptionRejected { topic } => CliError::SubscriptionEnded {
                message: format!("broker rejected subscription to '{topic}'"),
            },
            CoreError::Http {
                status: 404,
                message,
            } => CliError::NotFound { message },
            CoreError::Http { status, message } => CliError::Api { status, message },
            CoreError::InvalidResponse { message } => CliError::InvalidResponse { message },
            CoreError::Cancelled => CliError::Config {
                message: "request cancelled".into(),
            },
            CoreError::Config { message } => CliError::Config { message },
            CoreError::Internal(message) => CliError::Config {
                message: format!("internal error: {message}"),
            },
        }
    }
}

impl From<lookout_api::Error> for CliError {
    fn from(err: lookout_api::Error) -> Self {
        CoreError::from(err).into()
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::ProfileNotFound { name, available } => CliError::ProfileNotFound {
                name,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            },
            ConfigError::NoToken { profile } => CliError::NoToken { profile },
            ConfigError::Io(e) => CliError::Io(e),
            other => CliError::Config {
                message: other.to_string(),
            },
        }
    }
}
