//! Datagram framing for vtunnel
//!
//! Every UDP datagram carries a fixed cleartext header followed by a
//! (possibly encrypted) payload:
//!
//! ```text
//! +-------+-------+---------+----------------+----------+-------------+---------
//! | 'V'   | 'T'   | version | fingerprint 16 | msg_type | payload_len | payload
//! +-------+-------+---------+----------------+----------+-------------+---------
//!   0       1       2         3..19            19         20..22        22..
//! ```
//!
//! All integers are big-endian. The payload is the message body after
//! [`Crypto::encrypt`](crate::crypto::Crypto::encrypt).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::crypto::{fingerprints_match, Crypto, Fingerprint, FINGERPRINT_LEN};
use crate::route::RouteEntry;
use crate::{Error, Result};

/// Protocol identifier at the start of every datagram
pub const PROTOCOL_ID: [u8; 2] = *b"VT";

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 2 + 1 + FINGERPRINT_LEN + 1 + 2;

/// Room on top of the MTU for cipher overhead and body framing
pub const PAYLOAD_SLACK: usize = 64;

const LOGIN_HAS_IPV4: u8 = 0x01;
const LOGIN_HAS_IPV6: u8 = 0x02;
const ECHO_BODY_LEN: usize = 12;
const ROUTE_V4_LEN: usize = 2 + 4 + 4;
const ROUTE_V6_LEN: usize = 2 + 16 + 16;

/// Message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Data = 0x01,
    EchoRequest = 0x02,
    EchoAck = 0x03,
    ClientLogin = 0x04,
    RouteAdvertise = 0x05,
    Disconnect = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::Data),
            0x02 => Ok(MessageType::EchoRequest),
            0x03 => Ok(MessageType::EchoAck),
            0x04 => Ok(MessageType::ClientLogin),
            0x05 => Ok(MessageType::RouteAdvertise),
            0x06 => Ok(MessageType::Disconnect),
            other => Err(Error::Format(format!("unknown message type 0x{:02x}", other))),
        }
    }
}

/// Decoded datagram header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub fingerprint: Fingerprint,
    /// Raw type byte; validated only after the fingerprint check
    pub msg_type: u8,
    pub payload_len: u16,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..2].copy_from_slice(&PROTOCOL_ID);
        out[2] = PROTOCOL_VERSION;
        out[3..3 + FINGERPRINT_LEN].copy_from_slice(&self.fingerprint);
        out[19] = self.msg_type;
        out[20..22].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    /// Parse the fixed header. Checks length, protocol id and version.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Format(format!(
                "datagram too short: {} bytes, header needs {}",
                buf.len(),
                HEADER_LEN
            )));
        }
        if buf[..2] != PROTOCOL_ID {
            return Err(Error::Format("bad protocol identifier".into()));
        }
        if buf[2] != PROTOCOL_VERSION {
            return Err(Error::Format(format!("unsupported protocol version {}", buf[2])));
        }
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&buf[3..3 + FINGERPRINT_LEN]);
        Ok(Self {
            fingerprint,
            msg_type: buf[19],
            payload_len: u16::from_be_bytes([buf[20], buf[21]]),
        })
    }
}

/// Keepalive probe body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Echo {
    pub id: u32,
    pub timestamp_ms: u64,
}

/// Virtual tunnel addresses carried by CLIENT_LOGIN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelAddresses {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl TunnelAddresses {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }

    /// Whether `addr` is one of these addresses
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.ipv4.as_ref() == Some(v4),
            IpAddr::V6(v6) => self.ipv6.as_ref() == Some(v6),
        }
    }

    pub fn to_vec(&self) -> Vec<IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.ipv6.map(IpAddr::V6))
            .collect()
    }
}

/// A typed tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// One raw IP packet
    Data(Vec<u8>),
    EchoRequest(Echo),
    EchoAck(Echo),
    /// Client: requested addresses. Server: confirmed assignment.
    ClientLogin(TunnelAddresses),
    RouteAdvertise(Vec<RouteEntry>),
    Disconnect,
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Data(_) => MessageType::Data,
            Message::EchoRequest(_) => MessageType::EchoRequest,
            Message::EchoAck(_) => MessageType::EchoAck,
            Message::ClientLogin(_) => MessageType::ClientLogin,
            Message::RouteAdvertise(_) => MessageType::RouteAdvertise,
            Message::Disconnect => MessageType::Disconnect,
        }
    }

    /// Serialize the message body (before encryption)
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Message::Data(packet) => packet.clone(),
            Message::EchoRequest(echo) | Message::EchoAck(echo) => {
                let mut body = Vec::with_capacity(ECHO_BODY_LEN);
                body.extend_from_slice(&echo.id.to_be_bytes());
                body.extend_from_slice(&echo.timestamp_ms.to_be_bytes());
                body
            }
            Message::ClientLogin(addrs) => {
                let mut flags = 0u8;
                let mut body = vec![0u8];
                if let Some(v4) = addrs.ipv4 {
                    flags |= LOGIN_HAS_IPV4;
                    body.extend_from_slice(&v4.octets());
                }
                if let Some(v6) = addrs.ipv6 {
                    flags |= LOGIN_HAS_IPV6;
                    body.extend_from_slice(&v6.octets());
                }
                body[0] = flags;
                body
            }
            Message::RouteAdvertise(routes) => {
                let mut body = Vec::with_capacity(2 + routes.len() * ROUTE_V6_LEN);
                body.extend_from_slice(&(routes.len() as u16).to_be_bytes());
                for route in routes {
                    encode_route(route, &mut body);
                }
                body
            }
            Message::Disconnect => Vec::new(),
        }
    }

    /// Parse a decrypted body of the given type
    pub fn decode_body(msg_type: MessageType, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let message = match msg_type {
            MessageType::Data => {
                if body.is_empty() {
                    return Err(Error::Format("empty DATA payload".into()));
                }
                return Ok(Message::Data(body.to_vec()));
            }
            MessageType::EchoRequest | MessageType::EchoAck => {
                let echo = if body.is_empty() {
                    Echo::default()
                } else {
                    Echo {
                        id: r.u32()?,
                        timestamp_ms: r.u64()?,
                    }
                };
                if msg_type == MessageType::EchoRequest {
                    Message::EchoRequest(echo)
                } else {
                    Message::EchoAck(echo)
                }
            }
            MessageType::ClientLogin => {
                let flags = r.u8()?;
                if flags & !(LOGIN_HAS_IPV4 | LOGIN_HAS_IPV6) != 0 {
                    return Err(Error::Format(format!("unknown login flags 0x{:02x}", flags)));
                }
                let ipv4 = if flags & LOGIN_HAS_IPV4 != 0 { Some(r.ipv4()?) } else { None };
                let ipv6 = if flags & LOGIN_HAS_IPV6 != 0 { Some(r.ipv6()?) } else { None };
                Message::ClientLogin(TunnelAddresses { ipv4, ipv6 })
            }
            MessageType::RouteAdvertise => {
                let count = r.u16()? as usize;
                // Every entry takes at least ROUTE_V4_LEN bytes
                if count > r.remaining() / ROUTE_V4_LEN {
                    return Err(Error::Format(format!("route count {} exceeds payload", count)));
                }
                let mut routes = Vec::with_capacity(count);
                for _ in 0..count {
                    routes.push(decode_route(&mut r)?);
                }
                Message::RouteAdvertise(routes)
            }
            MessageType::Disconnect => Message::Disconnect,
        };
        if r.remaining() != 0 {
            return Err(Error::Format(format!(
                "{} trailing bytes in {:?} body",
                r.remaining(),
                msg_type
            )));
        }
        Ok(message)
    }
}

fn encode_route(route: &RouteEntry, out: &mut Vec<u8>) {
    match (route.network.addr(), route.gateway) {
        (IpAddr::V4(net), IpAddr::V4(gw)) => {
            out.push(4);
            out.push(route.prefix_len());
            out.extend_from_slice(&net.octets());
            out.extend_from_slice(&gw.octets());
        }
        (IpAddr::V6(net), IpAddr::V6(gw)) => {
            out.push(6);
            out.push(route.prefix_len());
            out.extend_from_slice(&net.octets());
            out.extend_from_slice(&gw.octets());
        }
        // RouteEntry::new rejects mixed families
        _ => {}
    }
}

fn decode_route(r: &mut Reader<'_>) -> Result<RouteEntry> {
    let family = r.u8()?;
    let prefix = r.u8()?;
    let (network, gateway) = match family {
        4 => (IpAddr::V4(r.ipv4()?), IpAddr::V4(r.ipv4()?)),
        6 => (IpAddr::V6(r.ipv6()?), IpAddr::V6(r.ipv6()?)),
        other => return Err(Error::Format(format!("unknown route family {}", other))),
    };
    RouteEntry::new(network, prefix, gateway)
        .map_err(|_| Error::Format(format!("invalid advertised route {}/{}", network, prefix)))
}

/// Bounds-checked big-endian reader
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Format(format!(
                "body truncated: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn ipv4(&mut self) -> Result<Ipv4Addr> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(Ipv4Addr::from(b))
    }

    fn ipv6(&mut self) -> Result<Ipv6Addr> {
        let mut b = [0u8; 16];
        b.copy_from_slice(self.take(16)?);
        Ok(Ipv6Addr::from(b))
    }
}

/// Encodes messages into authenticated datagrams and back
#[derive(Debug, Clone)]
pub struct Codec {
    crypto: Crypto,
    max_payload: usize,
}

impl Codec {
    /// `mtu` is the tunnel MTU; the payload limit adds [`PAYLOAD_SLACK`]
    pub fn new(crypto: Crypto, mtu: usize) -> Self {
        let max_payload = (mtu + PAYLOAD_SLACK).min(u16::MAX as usize);
        Self { crypto, max_payload }
    }

    pub fn crypto(&self) -> &Crypto {
        &self.crypto
    }

    /// Largest payload (after encryption) a datagram may carry
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Serialize and encrypt a message into a datagram
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let payload = self.crypto.encrypt(&message.encode_body());
        if payload.len() > self.max_payload {
            return Err(Error::Format(format!(
                "{:?} payload of {} bytes exceeds limit {}",
                message.msg_type(),
                payload.len(),
                self.max_payload
            )));
        }
        let header = Header {
            fingerprint: *self.crypto.fingerprint(),
            msg_type: message.msg_type() as u8,
            payload_len: payload.len() as u16,
        };
        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(&header.encode());
        datagram.extend_from_slice(&payload);
        Ok(datagram)
    }

    /// Validate, authenticate and decrypt a datagram.
    ///
    /// Checks run in order: header length, protocol id, fingerprint,
    /// payload length, decryption, body structure. Nothing is interpreted
    /// until every earlier check passed.
    pub fn decode(&self, datagram: &[u8]) -> Result<Message> {
        let header = Header::decode(datagram)?;
        if !fingerprints_match(&header.fingerprint, self.crypto.fingerprint()) {
            return Err(Error::AuthOrPadding);
        }
        let payload = &datagram[HEADER_LEN..];
        if payload.len() != header.payload_len as usize {
            return Err(Error::Format(format!(
                "declared payload length {} but {} bytes present",
                header.payload_len,
                payload.len()
            )));
        }
        if payload.len() > self.max_payload {
            return Err(Error::Format(format!(
                "payload of {} bytes exceeds limit {}",
                payload.len(),
                self.max_payload
            )));
        }
        let msg_type = MessageType::try_from(header.msg_type)?;
        let body = self.crypto.decrypt(payload)?;
        Message::decode_body(msg_type, &body)
    }

    /// Split a route list into ROUTE_ADVERTISE messages that each fit
    pub fn route_advertisements(&self, routes: &[RouteEntry]) -> Vec<Message> {
        let budget = self.max_payload.saturating_sub(self.crypto.overhead() + 2);
        let per_message = (budget / ROUTE_V6_LEN).max(1);
        routes
            .chunks(per_message)
            .map(|chunk| Message::RouteAdvertise(chunk.to_vec()))
            .collect()
    }
}
