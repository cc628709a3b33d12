// End-to-end tests for `WsMqttConnector` against an in-process
// MQTT-over-WebSocket broker built from the same packet codec.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;

use lookout_api::mqtt::packet::{ConnAck, Packet, Publish, QoS, SUBACK_FAILURE, SubAck};
use lookout_api::mqtt::{MqttOptions, ReconnectConfig, WsMqttConnector};
use lookout_api::{ChangeChannel, Error};

// ── Helpers ─────────────────────────────────────────────────────────

struct BrokerConn {
    ws: WebSocketStream<TcpStream>,
    buf: BytesMut,
}

impl BrokerConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_hdr_async(stream, accept_mqtt_subprotocol)
            .await
            .unwrap();
        Self {
            ws,
            buf: BytesMut::new(),
        }
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if let Some(packet) = Packet::decode(&mut self.buf).unwrap() {
                return packet;
            }
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => self.buf.extend_from_slice(&data),
                Some(Ok(_)) => {}
                other => panic!("client went away: {other:?}"),
            }
        }
    }

    async fn send(&mut self, packet: Packet) {
        self.ws
            .send(Message::Binary(packet.to_bytes().unwrap()))
            .await
            .unwrap();
    }

    /// Read CONNECT, answer CONNACK with `code`, return the username.
    async fn handshake(&mut self, code: u8) -> Option<String> {
        let Packet::Connect(connect) = self.recv().await else {
            panic!("expected CONNECT");
        };
        assert!(connect.client_id.starts_with("lookout-"));
        assert!(connect.clean_session);
        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: code,
        }))
        .await;
        connect.username
    }

    /// Read SUBSCRIBE, ack every filter with `code`, return the filters.
    async fn ack_subscribe(&mut self, code: u8) -> Vec<String> {
        let Packet::Subscribe(sub) = self.recv().await else {
            panic!("expected SUBSCRIBE");
        };
        self.send(Packet::SubAck(SubAck {
            packet_id: sub.packet_id,
            return_codes: vec![code; sub.filters.len()],
        }))
        .await;
        sub.filters.into_iter().map(|(f, _)| f).collect()
    }
}

#[allow(clippy::unnecessary_wraps)]
fn accept_mqtt_subprotocol(_req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    resp.headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
    Ok(resp)
}

fn publish(topic: &str, payload: &'static str, packet_id: Option<u16>) -> Packet {
    Packet::Publish(Publish {
        topic: topic.to_owned(),
        qos: if packet_id.is_some() {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        },
        retain: false,
        packet_id,
        payload: Bytes::from_static(payload.as_bytes()),
    })
}

async fn setup(options: MqttOptions) -> (TcpListener, ChangeChannel) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let channel = ChangeChannel::new(Arc::new(WsMqttConnector::new(options)));
    channel.configure("127.0.0.1", port, false, SecretString::from("tok-abc"));
    (listener, channel)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_subscribe_receive_and_disconnect() {
    let (listener, channel) = setup(MqttOptions::default()).await;
    let mut rx = channel.notifications();

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        assert_eq!(conn.handshake(0).await.as_deref(), Some("tok-abc"));

        assert_eq!(conn.ack_subscribe(1).await, vec!["changed/accounts/1/entities"]);
        conn.send(publish("changed/accounts/1/entities", r#"{"id":1}"#, Some(9)))
            .await;
        assert_eq!(conn.recv().await, Packet::PubAck(9));

        let Packet::Unsubscribe(unsub) = conn.recv().await else {
            panic!("expected UNSUBSCRIBE");
        };
        assert_eq!(unsub.filters, vec!["changed/accounts/1/entities"]);
        conn.send(Packet::UnsubAck(unsub.packet_id)).await;

        assert_eq!(conn.recv().await, Packet::Disconnect);
    });

    channel.ensure_connected().await.unwrap();
    channel.subscribe_topic("accounts/1/entities").await.unwrap();

    let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n.topic, "accounts/1/entities");
    assert_eq!(n.payload, r#"{"id":1}"#);

    channel.disconnect().await;
    broker.await.unwrap();
}

#[tokio::test]
async fn test_refused_connect_is_auth_failure() {
    let (listener, channel) = setup(MqttOptions::default()).await;

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake(5).await;
    });

    let err = channel.ensure_connected().await.unwrap_err();

    assert!(err.is_auth_expired(), "got {err:?}");
    assert!(!channel.is_connected());
    broker.await.unwrap();
}

#[tokio::test]
async fn test_suback_failure_rejects_subscription() {
    let (listener, channel) = setup(MqttOptions::default()).await;

    let broker = tokio::spawn(async move {
        let mut conn = BrokerConn::accept(&listener).await;
        conn.handshake(0).await;
        conn.ack_subscribe(SUBACK_FAILURE).await;
        // Hold the socket open until the client is done.
        let _ = conn.ws.next().await;
    });

    channel.ensure_connected().await.unwrap();
    let err = channel.subscribe_topic("accounts/2/secret").await.unwrap_err();

    match err {
        Error::SubscribeRejected { topic } => assert_eq!(topic, "changed/accounts/2/secret"),
        other => panic!("expected SubscribeRejected, got {other:?}"),
    }
    assert!(channel.tracked_topics().await.is_empty());

    channel.disconnect().await;
    broker.await.unwrap();
}

#[tokio::test]
async fn test_reconnects_and_resubscribes_after_drop() {
    let options = MqttOptions {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: Some(5),
        },
        ..MqttOptions::default()
    };
    let (listener, channel) = setup(options).await;
    let mut rx = channel.notifications();

    let broker = tokio::spawn(async move {
        let mut first = BrokerConn::accept(&listener).await;
        first.handshake(0).await;
        first.ack_subscribe(0).await;
        drop(first);

        let mut second = BrokerConn::accept(&listener).await;
        second.handshake(0).await;
        assert_eq!(second.ack_subscribe(0).await, vec!["changed/accounts/1/values"]);
        second
            .send(publish("changed/accounts/1/values", "{}", None))
            .await;

        let _ = second.ws.next().await;
    });

    channel.ensure_connected().await.unwrap();
    channel.subscribe_topic("accounts/1/values").await.unwrap();

    let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n.topic, "accounts/1/values");
    assert!(channel.is_connected());

    channel.disconnect().await;
    broker.await.unwrap();
}
