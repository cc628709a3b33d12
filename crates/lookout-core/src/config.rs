// ── Runtime sync configuration ──
//
// Describes *where* the backend and broker live and how to pace the sync.
// Never touches disk: lookout-config (or a test) builds a `SyncConfig` and
// hands it to `Session`.

use std::path::PathBuf;
use std::time::Duration;

use lookout_api::mqtt::{MqttOptions, ReconnectConfig};
use lookout_api::{TlsMode, TransportConfig};
use url::Url;

/// Default trailing-edge debounce window per subscription.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// TLS verification strategy for the REST API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification (self-signed dev backends).
    DangerAcceptInvalid,
}

impl From<&TlsVerification> for TlsMode {
    fn from(tls: &TlsVerification) -> Self {
        match tls {
            TlsVerification::SystemDefaults => Self::System,
            TlsVerification::CustomCa(path) => Self::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => Self::DangerAcceptInvalid,
        }
    }
}

/// Change-notification broker location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// `wss` when set, `ws` otherwise.
    pub secure: bool,
    /// WebSocket path, `/mqtt` unless the deployment says otherwise.
    pub path: String,
}

impl BrokerConfig {
    /// Broker co-located with the API: same host, same scheme, default port.
    pub fn for_api_root(api_root: &Url) -> Option<Self> {
        let host = api_root.host_str()?.to_owned();
        let secure = api_root.scheme() == "https";
        Some(Self {
            host,
            port: api_root.port_or_known_default()?,
            secure,
            path: "/mqtt".into(),
        })
    }
}

/// Everything a [`Session`](crate::Session) needs to run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST root, e.g. `https://grafolean.example.com/api`.
    pub api_root: Url,
    pub broker: BrokerConfig,
    pub tls: TlsVerification,
    /// HTTP request timeout.
    pub timeout: Duration,
    pub debounce: Duration,
    /// Bound on the broker handshake.
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub reconnect: ReconnectConfig,
}

impl SyncConfig {
    pub fn new(api_root: Url, broker: BrokerConfig) -> Self {
        Self {
            api_root,
            broker,
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
            debounce: DEFAULT_DEBOUNCE,
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            tls: TlsMode::from(&self.tls),
            timeout: self.timeout,
        }
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        MqttOptions {
            path: self.broker.path.clone(),
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect.clone(),
            ..MqttOptions::default()
        }
    }
}
