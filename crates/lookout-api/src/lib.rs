// lookout-api: wire-level clients for the monitoring backend (REST resources
// with token refresh, MQTT-over-WebSocket change notifications)

pub mod auth;
pub mod changes;
pub mod error;
pub mod mqtt;
pub mod resource;
pub mod transport;

pub use auth::{CredentialProvider, MemorySessionStorage, SessionStorage};
pub use changes::{BrokerConnector, BrokerParams, BrokerSession, ChangeChannel, ChangeNotification};
pub use error::Error;
pub use resource::{FetchOptions, QueryParams, ResourceClient};
pub use transport::{TlsMode, TransportConfig};
