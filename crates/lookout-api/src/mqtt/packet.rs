//! MQTT 3.1.1 control packets.
//!
//! Only the subset a change-notification subscriber needs: session
//! handshake, SUBSCRIBE/UNSUBSCRIBE with their acks, inbound PUBLISH (with
//! PUBACK for QoS 1), keep-alive pings, and DISCONNECT. Both directions are
//! implemented so the same codec can drive a test broker.
//!
//! [`Packet::decode`] is incremental: it returns `Ok(None)` until the buffer
//! holds a complete packet and consumes exactly one packet otherwise, so a
//! WebSocket frame carrying several (or half a) packet works naturally.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// SUBACK return code signalling a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

// ── QoS ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(Error::Protocol(format!("invalid QoS {other}"))),
        }
    }
}

// ── Packet bodies ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    /// 0 = accepted; 1-5 are the refusal codes from the 3.1.1 spec.
    pub return_code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    /// Present iff `qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

// ── Encoding ─────────────────────────────────────────────────────────

impl Packet {
    /// Append the wire form of this packet to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();

        let header = match self {
            Self::Connect(c) => {
                put_str(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if c.password.is_some() {
                    flags |= 0x40;
                }
                if c.username.is_some() {
                    flags |= 0x80;
                }
                body.put_u8(flags);
                body.put_u16(c.keep_alive);
                put_str(&mut body, &c.client_id)?;
                if let Some(ref username) = c.username {
                    put_str(&mut body, username)?;
                }
                if let Some(ref password) = c.password {
                    put_str(&mut body, password)?;
                }
                0x10
            }
            Self::ConnAck(a) => {
                body.put_u8(u8::from(a.session_present));
                body.put_u8(a.return_code);
                0x20
            }
            Self::Publish(p) => {
                put_str(&mut body, &p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    let id = p.packet_id.ok_or_else(|| {
                        Error::Protocol("QoS>0 PUBLISH without packet id".into())
                    })?;
                    body.put_u16(id);
                }
                body.extend_from_slice(&p.payload);
                0x30 | (p.qos.bits() << 1) | u8::from(p.retain)
            }
            Self::PubAck(id) => {
                body.put_u16(*id);
                0x40
            }
            Self::Subscribe(s) => {
                if s.filters.is_empty() {
                    return Err(Error::Protocol("SUBSCRIBE without filters".into()));
                }
                body.put_u16(s.packet_id);
                for (filter, qos) in &s.filters {
                    put_str(&mut body, filter)?;
                    body.put_u8(qos.bits());
                }
                0x82
            }
            Self::SubAck(s) => {
                body.put_u16(s.packet_id);
                body.extend_from_slice(&s.return_codes);
                0x90
            }
            Self::Unsubscribe(u) => {
                if u.filters.is_empty() {
                    return Err(Error::Protocol("UNSUBSCRIBE without filters".into()));
                }
                body.put_u16(u.packet_id);
                for filter in &u.filters {
                    put_str(&mut body, filter)?;
                }
                0xA2
            }
            Self::UnsubAck(id) => {
                body.put_u16(*id);
                0xB0
            }
            Self::PingReq => 0xC0,
            Self::PingResp => 0xD0,
            Self::Disconnect => 0xE0,
        };

        out.put_u8(header);
        put_remaining_length(out, body.len())?;
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        self.encode(&mut out)?;
        Ok(out.freeze())
    }
}

fn put_str(out: &mut BytesMut, s: &str) -> Result<(), Error> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::Protocol(format!("string of {} bytes exceeds 65535", s.len())))?;
    out.put_u16(len);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_remaining_length(out: &mut BytesMut, len: usize) -> Result<(), Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::Protocol(format!("packet of {len} bytes too large")));
    }
    let mut x = len;
    loop {
        let mut byte = u8::try_from(x % 128).unwrap_or_default();
        x /= 128;
        if x > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if x == 0 {
            return Ok(());
        }
    }
}

// ── Decoding ─────────────────────────────────────────────────────────

impl Packet {
    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` (consuming nothing) if the buffer does not yet
    /// contain a complete packet.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, Error> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let Some((remaining, len_bytes)) = read_remaining_length(buf.get(1..).unwrap_or_default())?
        else {
            return Ok(None);
        };

        let total = 1 + len_bytes + remaining;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        frame.advance(1 + len_bytes);
        let mut body = frame.freeze();
        let flags = first & 0x0F;

        let packet = match first >> 4 {
            1 => Self::Connect(decode_connect(&mut body)?),
            2 => {
                let ack_flags = get_u8(&mut body)?;
                Self::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 == 0x01,
                    return_code: get_u8(&mut body)?,
                })
            }
            3 => Self::Publish(decode_publish(flags, &mut body)?),
            4 => Self::PubAck(get_u16(&mut body)?),
            8 => {
                let packet_id = get_u16(&mut body)?;
                let mut filters = Vec::new();
                while body.has_remaining() {
                    let filter = get_str(&mut body)?;
                    let qos = QoS::from_bits(get_u8(&mut body)? & 0x03)?;
                    filters.push((filter, qos));
                }
                Self::Subscribe(Subscribe { packet_id, filters })
            }
            9 => Self::SubAck(SubAck {
                packet_id: get_u16(&mut body)?,
                return_codes: body.to_vec(),
            }),
            10 => {
                let packet_id = get_u16(&mut body)?;
                let mut filters = Vec::new();
                while body.has_remaining() {
                    filters.push(get_str(&mut body)?);
                }
                Self::Unsubscribe(Unsubscribe { packet_id, filters })
            }
            11 => Self::UnsubAck(get_u16(&mut body)?),
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            other => {
                return Err(Error::Protocol(format!("unsupported packet type {other}")));
            }
        };

        Ok(Some(packet))
    }
}

/// Returns `(value, bytes_used)`, or `None` if the length is still incomplete.
fn read_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, &byte) in bytes.iter().enumerate() {
        if i >= 4 {
            return Err(Error::Protocol("malformed remaining length".into()));
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if bytes.len() >= 4 {
        return Err(Error::Protocol("malformed remaining length".into()));
    }
    Ok(None)
}

fn decode_connect(body: &mut Bytes) -> Result<Connect, Error> {
    let name = get_str(body)?;
    if name != PROTOCOL_NAME {
        return Err(Error::Protocol(format!("unexpected protocol name {name:?}")));
    }
    let level = get_u8(body)?;
    if level != PROTOCOL_LEVEL {
        return Err(Error::Protocol(format!("unsupported protocol level {level}")));
    }
    let flags = get_u8(body)?;
    let keep_alive = get_u16(body)?;
    let client_id = get_str(body)?;

    // Will topic/message are never sent by this client; skip them if present.
    if flags & 0x04 != 0 {
        get_str(body)?;
        get_str(body)?;
    }

    let username = if flags & 0x80 != 0 {
        Some(get_str(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(get_str(body)?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        username,
        password,
        keep_alive,
        clean_session: flags & 0x02 != 0,
    })
}

fn decode_publish(flags: u8, body: &mut Bytes) -> Result<Publish, Error> {
    let qos = QoS::from_bits((flags >> 1) & 0x03)?;
    let topic = get_str(body)?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(get_u16(body)?)
    };
    let payload = body.split_off(0);

    Ok(Publish {
        topic,
        qos,
        retain: flags & 0x01 != 0,
        packet_id,
        payload,
    })
}

fn get_u8(body: &mut Bytes) -> Result<u8, Error> {
    if body.remaining() < 1 {
        return Err(Error::Protocol("truncated packet".into()));
    }
    Ok(body.get_u8())
}

fn get_u16(body: &mut Bytes) -> Result<u16, Error> {
    if body.remaining() < 2 {
        return Err(Error::Protocol("truncated packet".into()));
    }
    Ok(body.get_u16())
}

fn get_str(body: &mut Bytes) -> Result<String, Error> {
    let len = usize::from(get_u16(body)?);
    if body.remaining() < len {
        return Err(Error::Protocol("truncated string".into()));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol("string is not UTF-8".into()))
}

// ── Tests ────────────────────────────────────────────────────────────
