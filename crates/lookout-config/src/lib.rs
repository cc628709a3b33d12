//! Shared configuration for lookout.
//!
//! TOML profiles, token resolution (env + keyring + plaintext), and
//! translation to `lookout_core::SyncConfig`. The CLI layers its flag
//! overrides on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lookout_core::{BrokerConfig, SyncConfig, TlsVerification};

/// Keyring service all lookout secrets live under.
pub const KEYRING_SERVICE: &str = "lookout";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String, available: Vec<String> },

    #[error("no token configured for profile '{profile}'")]
    NoToken { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when `--profile` is not given.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up a profile by name, listing the known ones on failure.
    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles.get(name).ok_or_else(|| {
            let mut available: Vec<String> = self.profiles.keys().cloned().collect();
            available.sort();
            ConfigError::ProfileNotFound {
                name: name.into(),
                available,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            timeout: default_timeout(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_output() -> String {
    "json".into()
}
fn default_timeout() -> u64 {
    30
}
fn default_debounce_ms() -> u64 {
    1000
}

/// A named backend profile.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// REST root, e.g. "https://grafolean.example.com/api".
    pub api_root: String,

    /// Broker host; defaults to the API host.
    pub broker_host: Option<String>,

    /// Broker port; defaults to the API port.
    pub broker_port: Option<u16>,

    /// `wss` instead of `ws`; defaults to whether the API uses https.
    pub broker_secure: Option<bool>,

    /// WebSocket path on the broker.
    pub broker_path: Option<String>,

    /// Token in plaintext. Prefer the keyring or `token_env`.
    pub token: Option<String>,

    /// Environment variable holding the token.
    pub token_env: Option<String>,

    pub debounce_ms: Option<u64>,

    pub timeout: Option<u64>,

    pub insecure: Option<bool>,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("", "", "lookout").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("lookout");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading & saving ────────────────────────────────────────────────

/// Load the config from the canonical path plus `LOOKOUT_` environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` (missing file means defaults), then environment.
///
/// Nested keys use a double underscore:
/// `LOOKOUT_PROFILES__LAB__API_ROOT=...`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("LOOKOUT_").split("__"));

    Ok(figment.extract()?)
}

/// Serialize `cfg` to TOML at `path`, creating parent directories.
pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

// ── Token resolution ────────────────────────────────────────────────

/// Resolve a profile's token: `token_env`, then the keyring, then plaintext.
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    resolve_token_with(
        profile,
        profile_name,
        |name| std::env::var(name).ok(),
        || keyring_token(profile_name),
    )
}

fn resolve_token_with(
    profile: &Profile,
    profile_name: &str,
    env: impl Fn(&str) -> Option<String>,
    keyring: impl FnOnce() -> Option<String>,
) -> Result<SecretString, ConfigError> {
    // 1. Profile's token_env → env var lookup
    if let Some(token) = profile.token_env.as_deref().and_then(&env) {
        return Ok(SecretString::from(token));
    }

    // 2. System keyring
    if let Some(token) = keyring() {
        return Ok(SecretString::from(token));
    }

    // 3. Plaintext in config
    if let Some(ref token) = profile.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoToken {
        profile: profile_name.into(),
    })
}

fn keyring_entry(profile_name: &str) -> Result<keyring::Entry, keyring::Error> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/token"))
}

fn keyring_token(profile_name: &str) -> Option<String> {
    keyring_entry(profile_name).ok()?.get_password().ok()
}

/// Store a profile's token in the system keyring.
pub fn store_token(profile_name: &str, token: &str) -> Result<(), ConfigError> {
    keyring_entry(profile_name)?.set_password(token)?;
    Ok(())
}

/// Remove a profile's token from the keyring. A missing entry is fine.
pub fn forget_token(profile_name: &str) -> Result<(), ConfigError> {
    match keyring_entry(profile_name)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ── Profile → SyncConfig ────────────────────────────────────────────

/// Build a `SyncConfig` from a profile, filling gaps from `defaults`.
pub fn profile_to_sync_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<SyncConfig, ConfigError> {
    let api_root: url::Url = profile
        .api_root
        .parse()
        .map_err(|_| ConfigError::Validation {
            field: "api_root".into(),
            reason: format!("invalid URL: {}", profile.api_root),
        })?;

    let broker = resolve_broker(profile, &api_root)?;

    let tls = if profile.insecure.unwrap_or(false) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    let mut config = SyncConfig::new(api_root, broker);
    config.tls = tls;
    config.timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    config.debounce = Duration::from_millis(profile.debounce_ms.unwrap_or(defaults.debounce_ms));
    Ok(config)
}

fn resolve_broker(profile: &Profile, api_root: &url::Url) -> Result<BrokerConfig, ConfigError> {
    let mut broker = BrokerConfig::for_api_root(api_root).ok_or_else(|| {
        ConfigError::Validation {
            field: "api_root".into(),
            reason: format!("no host in {api_root}"),
        }
    })?;

    if let Some(ref host) = profile.broker_host {
        broker.host.clone_from(host);
    }
    if let Some(secure) = profile.broker_secure {
        broker.secure = secure;
    }
    if let Some(port) = profile.broker_port {
        broker.port = port;
    }
    if let Some(ref path) = profile.broker_path {
        if !path.starts_with('/') {
            return Err(ConfigError::Validation {
                field: "broker_path".into(),
                reason: format!("must start with '/': {path}"),
            });
        }
        broker.path.clone_from(path);
    }
    Ok(broker)
}
