// MQTT 3.1.1 over WebSocket.
//
// A background task owns the socket. Callers talk to it through an mpsc
// command channel and get answers on oneshots, so SUBACK/UNSUBACK matching
// stays inside one task. When the socket drops the task reconnects with
// exponential backoff and re-subscribes every filter it holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::packet::{Connect, Packet, QoS, SUBACK_FAILURE, Subscribe, Unsubscribe};
use crate::changes::{BrokerConnector, BrokerParams, BrokerSession, NotificationSink};
use crate::error::Error;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const MQTT_SUBPROTOCOL: &str = "mqtt";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff for broker reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive failed attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── MqttOptions ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// WebSocket path on the broker host. Default: `/mqtt`.
    pub path: String,
    /// Keep-alive interval announced in CONNECT. Default: 60s.
    pub keep_alive: Duration,
    /// Bound on each reconnect handshake. The first connect is bounded by
    /// the change channel instead.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Client ids are `{prefix}-{uuid}`.
    pub client_id_prefix: String,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            path: "/mqtt".into(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            client_id_prefix: "lookout".into(),
        }
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// [`BrokerConnector`] speaking MQTT 3.1.1 over a WebSocket (`mqtt`
/// sub-protocol). The access token is sent as the MQTT username.
#[derive(Debug, Clone, Default)]
pub struct WsMqttConnector {
    options: MqttOptions,
}

impl WsMqttConnector {
    pub fn new(options: MqttOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }
}

#[async_trait]
impl BrokerConnector for WsMqttConnector {
    async fn connect(
        &self,
        params: watch::Receiver<Option<BrokerParams>>,
        sink: NotificationSink,
    ) -> Result<Box<dyn BrokerSession>, Error> {
        let current = params.borrow().clone().ok_or(Error::NotConfigured)?;
        let conn = Connection::open(&current, &self.options).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(session_loop(
            conn,
            params,
            sink,
            self.options.clone(),
            cmd_rx,
            cancel.clone(),
        ));

        Ok(Box::new(WsMqttSession {
            cmd_tx,
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        }))
    }
}

/// Build `ws[s]://host:port/path`.
pub fn broker_url(params: &BrokerParams, path: &str) -> Result<Url, Error> {
    let scheme = if params.secure { "wss" } else { "ws" };
    let path = path.trim_start_matches('/');
    let url = Url::parse(&format!("{scheme}://{}:{}/{path}", params.host, params.port))?;
    Ok(url)
}

// ── Session handle ───────────────────────────────────────────────────

enum Command {
    Subscribe {
        filter: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Unsubscribe {
        filter: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

struct WsMqttSession {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WsMqttSession {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), Error>>) -> Command + Send,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::NotConnected)?
    }
}

#[async_trait]
impl BrokerSession for WsMqttSession {
    async fn subscribe(&self, filter: &str) -> Result<(), Error> {
        let filter = filter.to_owned();
        self.request(|reply| Command::Subscribe { filter, reply }).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        let filter = filter.to_owned();
        self.request(|reply| Command::Unsubscribe { filter, reply })
            .await
    }

    async fn close(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for WsMqttSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// One WebSocket carrying an MQTT stream, plus the undecoded tail.
struct Connection {
    ws: WsStream,
    buf: BytesMut,
}

impl Connection {
    /// WebSocket upgrade + CONNECT/CONNACK.
    async fn open(params: &BrokerParams, options: &MqttOptions) -> Result<Self, Error> {
        let url = broker_url(params, &options.path)?;
        info!(url = %url, "connecting to MQTT broker");

        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;
        let request = ClientRequestBuilder::new(uri).with_sub_protocol(MQTT_SUBPROTOCOL);

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let mut conn = Self {
            ws,
            buf: BytesMut::new(),
        };

        let client_id = format!("{}-{}", options.client_id_prefix, uuid::Uuid::new_v4().simple());
        conn.send(&Packet::Connect(Connect {
            client_id: client_id.clone(),
            username: Some(params.token.expose_secret().to_owned()),
            password: None,
            keep_alive: keep_alive_secs(options.keep_alive),
            clean_session: true,
        }))
        .await?;

        match conn.next_packet().await? {
            Some(Packet::ConnAck(ack)) if ack.return_code == 0 => {
                info!(%client_id, "MQTT session established");
                Ok(conn)
            }
            Some(Packet::ConnAck(ack)) => Err(Error::ConnectionRefused {
                code: ack.return_code,
            }),
            Some(other) => Err(Error::Protocol(format!("expected CONNACK, got {other:?}"))),
            None => Err(Error::WebSocketClosed {
                code: 1006,
                reason: "closed during handshake".into(),
            }),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        let bytes = packet.to_bytes()?;
        self.ws
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }

    /// Next complete packet; `None` when the stream ends.
    ///
    /// Cancel-safe: the only await point is the frame read, and every frame
    /// is appended to `buf` before it is decoded.
    async fn next_packet(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.buf)? {
                return Ok(Some(packet));
            }

            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => self.buf.extend_from_slice(&data),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((1005, String::new()), |cf| {
                        (u16::from(cf.code), cf.reason.as_str().to_owned())
                    });
                    return Err(Error::WebSocketClosed { code, reason });
                }
                Some(Ok(_)) => {
                    // Text, Ping, Pong, Frame -- tungstenite answers pings itself
                }
                Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn shutdown(mut self) {
        let _ = self.send(&Packet::Disconnect).await;
        let _ = self.ws.close(None).await;
    }
}

fn keep_alive_secs(keep_alive: Duration) -> u16 {
    u16::try_from(keep_alive.as_secs()).unwrap_or(u16::MAX)
}

// ── Session state ────────────────────────────────────────────────────

enum PendingAck {
    Subscribe {
        filter: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// Re-subscription after reconnect; nobody is waiting on it.
    Restore { filters: Vec<String> },
}

/// Survives reconnects: the filter set is what gets restored.
#[derive(Default)]
struct SessionState {
    filters: BTreeSet<String>,
    pending: HashMap<u16, PendingAck>,
    last_packet_id: u16,
}

impl SessionState {
    fn next_packet_id(&mut self) -> u16 {
        self.last_packet_id = self.last_packet_id.checked_add(1).unwrap_or(1);
        self.last_packet_id
    }

    /// Serve one connection until it fails (`Err`) or the session is shut
    /// down (`Ok`).
    async fn drive(
        &mut self,
        conn: &mut Connection,
        sink: &NotificationSink,
        cmd_rx: &mut mpsc::Receiver<Command>,
        cancel: &CancellationToken,
        keep_alive: Duration,
    ) -> Result<(), Error> {
        let keep_alive = keep_alive.max(Duration::from_secs(1));
        let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();
        let dead_after = keep_alive.mul_f64(1.5);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    self.send_command(conn, cmd).await?;
                }
                packet = conn.next_packet() => {
                    let Some(packet) = packet? else {
                        return Err(Error::WebSocketClosed {
                            code: 1006,
                            reason: "stream ended".into(),
                        });
                    };
                    last_inbound = Instant::now();
                    self.handle_inbound(conn, sink, packet).await?;
                }
                _ = ping.tick() => {
                    if last_inbound.elapsed() > dead_after {
                        return Err(Error::Protocol("keep-alive timeout".into()));
                    }
                    trace!("sending PINGREQ");
                    conn.send(&Packet::PingReq).await?;
                }
            }
        }
    }

    async fn send_command(&mut self, conn: &mut Connection, cmd: Command) -> Result<(), Error> {
        match cmd {
            Command::Subscribe { filter, reply } => {
                if self.filters.contains(&filter) {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                let packet_id = self.next_packet_id();
                let packet = Packet::Subscribe(Subscribe {
                    packet_id,
                    filters: vec![(filter.clone(), QoS::AtLeastOnce)],
                });
                debug!(%filter, packet_id, "SUBSCRIBE");
                self.pending
                    .insert(packet_id, PendingAck::Subscribe { filter, reply });
                conn.send(&packet).await
            }
            Command::Unsubscribe { filter, reply } => {
                self.filters.remove(&filter);
                let packet_id = self.next_packet_id();
                let packet = Packet::Unsubscribe(Unsubscribe {
                    packet_id,
                    filters: vec![filter.clone()],
                });
                debug!(%filter, packet_id, "UNSUBSCRIBE");
                self.pending
                    .insert(packet_id, PendingAck::Unsubscribe { reply });
                conn.send(&packet).await
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        conn: &mut Connection,
        sink: &NotificationSink,
        packet: Packet,
    ) -> Result<(), Error> {
        match packet {
            Packet::Publish(publish) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "PUBLISH");
                if let (QoS::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                    conn.send(&Packet::PubAck(id)).await?;
                }
                sink.deliver(&publish.topic, &publish.payload);
            }
            Packet::SubAck(ack) => match self.pending.remove(&ack.packet_id) {
                Some(PendingAck::Subscribe { filter, reply }) => {
                    if ack.return_codes.contains(&SUBACK_FAILURE) {
                        warn!(%filter, "broker rejected subscription");
                        let _ = reply.send(Err(Error::SubscribeRejected { topic: filter }));
                    } else {
                        self.filters.insert(filter);
                        let _ = reply.send(Ok(()));
                    }
                }
                Some(PendingAck::Restore { filters }) => {
                    for (filter, code) in filters.iter().zip(&ack.return_codes) {
                        if *code == SUBACK_FAILURE {
                            warn!(%filter, "broker rejected re-subscription after reconnect");
                            self.filters.remove(filter);
                        }
                    }
                }
                Some(other) => {
                    debug!(packet_id = ack.packet_id, "SUBACK for a non-subscribe request");
                    self.pending.insert(ack.packet_id, other);
                }
                None => debug!(packet_id = ack.packet_id, "unmatched SUBACK"),
            },
            Packet::UnsubAck(packet_id) => match self.pending.remove(&packet_id) {
                Some(PendingAck::Unsubscribe { reply }) => {
                    let _ = reply.send(Ok(()));
                }
                Some(other) => {
                    debug!(packet_id, "UNSUBACK for a non-unsubscribe request");
                    self.pending.insert(packet_id, other);
                }
                None => debug!(packet_id, "unmatched UNSUBACK"),
            },
            Packet::PingResp => trace!("PINGRESP"),
            other => debug!(packet = ?other, "ignoring unexpected packet from broker"),
        }
        Ok(())
    }

    /// The socket is gone. Requests in flight are settled against the
    /// filter set; the restore after reconnect carries them.
    fn connection_lost(&mut self) {
        for (_, pending) in self.pending.drain() {
            match pending {
                PendingAck::Subscribe { filter, reply } => {
                    self.filters.insert(filter);
                    let _ = reply.send(Ok(()));
                }
                PendingAck::Unsubscribe { reply } => {
                    let _ = reply.send(Ok(()));
                }
                PendingAck::Restore { .. } => {}
            }
        }
    }

    /// Commands that arrive between connections only touch the filter set.
    fn apply_offline(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { filter, reply } => {
                self.filters.insert(filter);
                let _ = reply.send(Ok(()));
            }
            Command::Unsubscribe { filter, reply } => {
                self.filters.remove(&filter);
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn restore(&mut self, conn: &mut Connection) -> Result<(), Error> {
        if self.filters.is_empty() {
            return Ok(());
        }
        let filters: Vec<String> = self.filters.iter().cloned().collect();
        let packet_id = self.next_packet_id();
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            filters: filters
                .iter()
                .map(|f| (f.clone(), QoS::AtLeastOnce))
                .collect(),
        });
        info!(count = filters.len(), "re-subscribing after reconnect");
        self.pending.insert(packet_id, PendingAck::Restore { filters });
        conn.send(&packet).await
    }

    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            match pending {
                PendingAck::Subscribe { reply, .. } | PendingAck::Unsubscribe { reply } => {
                    let _ = reply.send(Err(Error::NotConnected));
                }
                PendingAck::Restore { .. } => {}
            }
        }
    }
}

// ── Background task ──────────────────────────────────────────────────

async fn session_loop(
    mut conn: Connection,
    mut params: watch::Receiver<Option<BrokerParams>>,
    sink: NotificationSink,
    options: MqttOptions,
    mut cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    let mut state = SessionState::default();

    loop {
        match state
            .drive(&mut conn, &sink, &mut cmd_rx, &cancel, options.keep_alive)
            .await
        {
            Ok(()) => {
                state.fail_pending();
                conn.shutdown().await;
                break;
            }
            Err(e) => {
                warn!(error = %e, "MQTT connection lost");
                state.connection_lost();
            }
        }

        match reconnect(&mut state, &mut params, &options, &mut cmd_rx, &cancel).await {
            Some(next) => conn = next,
            None => break,
        }

        if let Err(e) = state.restore(&mut conn).await {
            warn!(error = %e, "re-subscribe failed, connection will be retried");
        }
    }

    cancel.cancel();
    debug!("MQTT session loop exiting");
}

/// Back off and reconnect until it works, the session is cancelled, the
/// channel is unconfigured, or the retry budget runs out.
async fn reconnect(
    state: &mut SessionState,
    params: &mut watch::Receiver<Option<BrokerParams>>,
    options: &MqttOptions,
    cmd_rx: &mut mpsc::Receiver<Command>,
    cancel: &CancellationToken,
) -> Option<Connection> {
    let mut attempt: u32 = 0;

    loop {
        if let Some(max) = options.reconnect.max_retries {
            if attempt >= max {
                error!(max_retries = max, "MQTT reconnection limit reached, giving up");
                return None;
            }
        }

        let delay = calculate_backoff(attempt, &options.reconnect);
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "waiting before reconnect"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => state.apply_offline(cmd),
                    None => return None,
                },
            }
        }

        // Latest parameters: the token may have been rotated meanwhile.
        let Some(current) = params.borrow_and_update().clone() else {
            debug!("change channel unconfigured, not reconnecting");
            return None;
        };

        attempt += 1;
        let open = tokio::time::timeout(options.connect_timeout, Connection::open(&current, options));
        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            result = open => match result {
                Ok(Ok(conn)) => return Some(conn),
                Ok(Err(e)) => warn!(error = %e, attempt, "MQTT reconnect failed"),
                Err(_) => warn!(attempt, "MQTT reconnect timed out"),
            },
        }
    }
}

/// Exponential backoff with deterministic jitter.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Seeded from the attempt number; spreads clients without an RNG.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn params(secure: bool) -> BrokerParams {
        BrokerParams {
            host: "broker.example.com".into(),
            port: 9883,
            secure,
            token: SecretString::from("t0ken"),
        }
    }

    #[test]
    fn default_options() {
        let options = MqttOptions::default();
        assert_eq!(options.path, "/mqtt");
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert!(options.reconnect.max_retries.is_none());
    }

    #[test]
    fn url_scheme_follows_secure_flag() {
        let url = broker_url(&params(true), "/mqtt").unwrap();
        assert_eq!(url.as_str(), "wss://broker.example.com:9883/mqtt");

        let url = broker_url(&params(false), "ws").unwrap();
        assert_eq!(url.as_str(), "ws://broker.example.com:9883/ws");
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        // Jitter tops out at 1.25x.
        for attempt in [10, 40, u32::MAX] {
            let d = calculate_backoff(attempt, &config);
            assert!(d <= Duration::from_millis(12_500), "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn keep_alive_saturates() {
        assert_eq!(keep_alive_secs(Duration::from_secs(60)), 60);
        assert_eq!(keep_alive_secs(Duration::from_secs(1_000_000)), u16::MAX);
    }

    #[test]
    fn packet_ids_skip_zero() {
        let mut state = SessionState {
            last_packet_id: u16::MAX - 1,
            ..SessionState::default()
        };
        assert_eq!(state.next_packet_id(), u16::MAX);
        assert_eq!(state.next_packet_id(), 1);
    }

    #[test]
    fn lost_connection_settles_pending_requests() {
        let mut state = SessionState::default();
        let (sub_tx, mut sub_rx) = oneshot::channel();
        let (unsub_tx, mut unsub_rx) = oneshot::channel();
        state.pending.insert(
            1,
            PendingAck::Subscribe {
                filter: "changed/a".into(),
                reply: sub_tx,
            },
        );
        state
            .pending
            .insert(2, PendingAck::Unsubscribe { reply: unsub_tx });

        state.connection_lost();

        assert!(sub_rx.try_recv().unwrap().is_ok());
        assert!(unsub_rx.try_recv().unwrap().is_ok());
        assert!(state.filters.contains("changed/a"));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn offline_commands_edit_filter_set() {
        let mut state = SessionState::default();
        let (tx, mut rx) = oneshot::channel();
        state.apply_offline(Command::Subscribe {
            filter: "changed/x".into(),
            reply: tx,
        });
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(state.filters.contains("changed/x"));

        let (tx, _rx) = oneshot::channel();
        state.apply_offline(Command::Unsubscribe {
            filter: "changed/x".into(),
            reply: tx,
        });
        assert!(state.filters.is_empty());
    }
}
