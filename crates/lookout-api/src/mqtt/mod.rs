//! MQTT 3.1.1 over WebSocket: the wire codec and a [`BrokerConnector`]
//! built on it.
//!
//! [`BrokerConnector`]: crate::changes::BrokerConnector

pub mod packet;
mod session;

pub use session::{MqttOptions, ReconnectConfig, WsMqttConnector, broker_url};
