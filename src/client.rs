//! Client engine
//!
//! Drives one session against one server:
//!
//! ```text
//! Disconnected --login sent--> LoginSent --any valid datagram--> Established
//!      ^                           |                                  |
//!      +------- reconnect timeout or DISCONNECT from the server ------+
//! ```
//!
//! A malformed datagram never changes state. Only silence for longer than
//! the reconnect timeout does, and then the session is thrown away and
//! rebuilt so the server sees a fresh login.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::{Mode, TunnelConfig};
use crate::event_loop::{Engine, Io};
use crate::netconf::{HostOutcome, HostRequest};
use crate::packet::{Codec, Message, TunnelAddresses};
use crate::peer::PeerSession;
use crate::route::RouteTable;
use crate::status::{Counters, TunnelStatus};
use crate::transport;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    LoginSent,
    Established,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientState::Disconnected => "disconnected",
            ClientState::LoginSent => "login-sent",
            ClientState::Established => "established",
        })
    }
}

/// Client engine settings taken from the tunnel configuration
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server: SocketAddr,
    /// Host name to re-resolve after a timeout
    pub server_host: String,
    /// Addresses requested in CLIENT_LOGIN
    pub requested: TunnelAddresses,
    pub keepalive: Duration,
    pub reconnect_timeout: Duration,
    pub interface: String,
}

impl ClientOptions {
    pub fn from_config(config: &TunnelConfig, interface: &str) -> Result<Self> {
        let Mode::Client { server, host } = &config.mode else {
            return Err(Error::Config("client engine needs --remote".into()));
        };
        Ok(Self {
            server: *server,
            server_host: host.clone(),
            requested: config.tunnel_addresses(),
            keepalive: config.keepalive,
            reconnect_timeout: config.reconnect_timeout,
            interface: interface.to_string(),
        })
    }
}

pub struct ClientEngine {
    codec: Codec,
    options: ClientOptions,
    state: ClientState,
    /// Present while LoginSent or Established
    session: Option<PeerSession>,
    last_login: Option<Instant>,
    /// Addresses the server confirmed
    assigned: Option<TunnelAddresses>,
    routes: RouteTable,
    host_requests: Vec<HostRequest>,
    counters: Counters,
    started: Instant,
}

impl ClientEngine {
    /// `routes` holds the locally configured routes; advertised ones are
    /// added at runtime
    pub fn new(codec: Codec, routes: RouteTable, options: ClientOptions, now: Instant) -> Self {
        info!("Client engine ready, server {}", options.server);
        Self {
            codec,
            options,
            state: ClientState::Disconnected,
            session: None,
            last_login: None,
            assigned: None,
            routes,
            host_requests: Vec::new(),
            counters: Counters::default(),
            started: now,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }

    pub fn server(&self) -> SocketAddr {
        self.options.server
    }

    pub fn assigned(&self) -> Option<TunnelAddresses> {
        self.assigned
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    fn send(&mut self, io: &mut Io<'_>, message: &Message) {
        let server = self.options.server;
        match transport::send_message(io.socket, &self.codec, message, server) {
            Ok(n) => {
                self.counters.datagrams_out += 1;
                if let Some(session) = self.session.as_mut() {
                    session.record_tx(n);
                }
            }
            Err(e) => warn!("Send to {} failed: {}", server, e),
        }
    }

    /// Start a fresh session and ask the server for our addresses
    fn login(&mut self, io: &mut Io<'_>, now: Instant) {
        if self.session.is_none() {
            self.session = Some(PeerSession::new(self.options.server, now));
        }
        let request = Message::ClientLogin(self.options.requested);
        self.send(io, &request);
        self.last_login = Some(now);
        if self.state != ClientState::LoginSent {
            info!("Logging in to {}", self.options.server);
            self.state = ClientState::LoginSent;
        }
    }

    fn disconnect(&mut self, reason: &str, resolve: bool) {
        info!("Disconnected from {}: {}", self.options.server, reason);
        self.state = ClientState::Disconnected;
        self.session = None;
        self.last_login = None;
        self.assigned = None;
        if resolve {
            self.host_requests.push(HostRequest::Resolve {
                host: self.options.server_host.clone(),
                current: self.options.server,
            });
        }
    }

    fn handle_confirmation(&mut self, assigned: TunnelAddresses) {
        if self.assigned == Some(assigned) {
            return;
        }
        info!(
            "Server confirmed addresses {} / {}",
            assigned.ipv4.map_or_else(|| "-".to_string(), |a| a.to_string()),
            assigned.ipv6.map_or_else(|| "-".to_string(), |a| a.to_string())
        );
        let requested = self.options.requested;
        if requested.ipv4.is_some() && requested.ipv4 != assigned.ipv4 {
            warn!(
                "Server assigned {:?} but the interface is configured with {:?}",
                assigned.ipv4, requested.ipv4
            );
        }
        if requested.ipv6.is_some() && requested.ipv6 != assigned.ipv6 {
            warn!(
                "Server assigned {:?} but the interface is configured with {:?}",
                assigned.ipv6, requested.ipv6
            );
        }
        self.assigned = Some(assigned);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Engine for ClientEngine {
    fn on_device_packet(&mut self, io: &mut Io<'_>, packet: &[u8], _now: Instant) {
        if self.session.is_none() {
            debug!("No session, dropping {} byte packet", packet.len());
            self.counters.dropped_unroutable += 1;
            return;
        }
        self.send(io, &Message::Data(packet.to_vec()));
    }

    fn on_datagram(&mut self, io: &mut Io<'_>, datagram: &[u8], from: SocketAddr, now: Instant) {
        if from != self.options.server {
            debug!("Ignoring datagram from {}", from);
            self.counters.dropped_unknown += 1;
            return;
        }
        let message = match self.codec.decode(datagram) {
            Ok(message) => message,
            Err(Error::AuthOrPadding) => {
                debug!("Dropped unauthenticated datagram from {}", from);
                self.counters.dropped_auth += 1;
                return;
            }
            Err(e) => {
                debug!("Dropped datagram from {}: {}", from, e);
                self.counters.dropped_format += 1;
                return;
            }
        };
        self.counters.datagrams_in += 1;

        let Some(session) = self.session.as_mut() else {
            debug!("No session, ignoring {:?} from server", message.msg_type());
            return;
        };
        session.touch(now, datagram.len());

        if message == Message::Disconnect {
            self.disconnect("server closed the session", false);
            return;
        }
        if self.state == ClientState::LoginSent {
            info!("Tunnel established with {}", self.options.server);
            self.state = ClientState::Established;
        }

        match message {
            Message::Data(packet) => match io.device.write_packet(&packet) {
                Ok(()) => self.counters.device_writes += 1,
                Err(e) => warn!("TUN write error: {}", e),
            },
            Message::EchoRequest(echo) => self.send(io, &Message::EchoAck(echo)),
            Message::EchoAck(echo) => {
                if let Some(session) = self.session.as_mut() {
                    if session.ack_echo(&echo) && echo.timestamp_ms > 0 {
                        debug!("Keepalive rtt {}ms", unix_millis().saturating_sub(echo.timestamp_ms));
                    }
                }
            }
            Message::ClientLogin(assigned) => self.handle_confirmation(assigned),
            Message::RouteAdvertise(entries) => {
                for entry in entries {
                    if self.routes.insert(entry) {
                        info!("Installing advertised route {}", entry);
                        self.host_requests.push(HostRequest::InstallRoute(entry));
                    }
                }
            }
            Message::Disconnect => {}
        }
    }

    fn on_tick(&mut self, io: &mut Io<'_>, now: Instant) {
        let idle = self.session.as_ref().map(|s| s.idle_for(now));
        match self.state {
            ClientState::Disconnected => self.login(io, now),
            ClientState::LoginSent => {
                if idle.map_or(false, |idle| idle > self.options.reconnect_timeout) {
                    self.disconnect("no reply to login", true);
                } else if self
                    .last_login
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.options.keepalive)
                {
                    debug!("Retrying login to {}", self.options.server);
                    self.login(io, now);
                }
            }
            ClientState::Established => {
                if idle.map_or(true, |idle| idle > self.options.reconnect_timeout) {
                    self.disconnect("server timed out", true);
                    return;
                }
                let keepalive = self.options.keepalive;
                let echo = match self.session.as_mut() {
                    Some(session) if session.keepalive_due(now, keepalive) => {
                        session.next_echo(now, unix_millis())
                    }
                    _ => return,
                };
                self.send(io, &Message::EchoRequest(echo));
            }
        }
    }

    fn on_shutdown(&mut self, io: &mut Io<'_>) {
        if self.session.is_some() {
            self.send(io, &Message::Disconnect);
            self.disconnect("shutting down", false);
        }
    }

    fn take_host_requests(&mut self) -> Vec<HostRequest> {
        std::mem::take(&mut self.host_requests)
    }

    fn on_host_outcome(&mut self, outcome: HostOutcome) {
        match outcome {
            HostOutcome::Resolved(addr) => {
                if addr != self.options.server {
                    info!("Server address changed {} -> {}", self.options.server, addr);
                    self.options.server = addr;
                    if let Some(session) = self.session.as_mut() {
                        session.endpoint = addr;
                    }
                }
            }
            HostOutcome::RouteInstalled(route) => debug!("Route {} installed", route),
            HostOutcome::Failed(reason) => warn!("Host configuration failed: {}", reason),
        }
    }

    fn status(&self, now: Instant) -> TunnelStatus {
        TunnelStatus {
            mode: "client".into(),
            interface: self.options.interface.clone(),
            state: Some(self.state.to_string()),
            server: Some(self.options.server.to_string()),
            encrypted: self.codec.crypto().is_encrypted(),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            sessions: self.session.iter().map(|s| s.snapshot(now)).collect(),
            routes: self.routes.all().iter().map(|r| r.to_string()).collect(),
            counters: self.counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Crypto;
    use crate::packet::Echo;
    use crate::server::tests::{ipv4_packet, MockDevice, MockSocket};
    use std::net::Ipv4Addr;

    const SERVER: ([u8; 4], u16) = ([192, 0, 2, 1], 1414);

    fn codec(pass: &str) -> Codec {
        Codec::new(Crypto::from_passphrase(Some(pass)), 1416)
    }

    fn options() -> ClientOptions {
        ClientOptions {
            server: SocketAddr::from(SERVER),
            server_host: "192.0.2.1:1414".into(),
            requested: TunnelAddresses::default(),
            keepalive: Duration::from_secs(13),
            reconnect_timeout: Duration::from_secs(60),
            interface: "vt0".into(),
        }
    }

    struct Harness {
        device: MockDevice,
        socket: MockSocket,
        codec: Codec,
        engine: ClientEngine,
        start: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let start = Instant::now();
            Self {
                device: MockDevice::default(),
                socket: MockSocket::default(),
                codec: codec("secret"),
                engine: ClientEngine::new(codec("secret"), RouteTable::new(), options(), start),
                start,
            }
        }

        fn at(&self, secs: u64) -> Instant {
            self.start + Duration::from_secs(secs)
        }

        fn tick(&mut self, secs: u64) {
            let now = self.at(secs);
            let mut io = Io {
                device: &mut self.device,
                socket: &self.socket,
            };
            self.engine.on_tick(&mut io, now);
        }

        fn from_server(&mut self, message: &Message, secs: u64) {
            let datagram = self.codec.encode(message).unwrap();
            self.raw(&datagram, SocketAddr::from(SERVER), secs);
        }

        fn raw(&mut self, datagram: &[u8], from: SocketAddr, secs: u64) {
            let now = self.at(secs);
            let mut io = Io {
                device: &mut self.device,
                socket: &self.socket,
            };
            self.engine.on_datagram(&mut io, datagram, from, now);
        }

        fn sent(&self) -> Vec<Message> {
            self.socket
                .sent
                .borrow_mut()
                .drain(..)
                .map(|(d, to)| {
                    assert_eq!(to, SocketAddr::from(SERVER));
                    self.codec.decode(&d).unwrap()
                })
                .collect()
        }
    }

    fn confirmation() -> Message {
        Message::ClientLogin(TunnelAddresses {
            ipv4: Some(Ipv4Addr::new(10, 7, 0, 2)),
            ipv6: None,
        })
    }

    #[test]
    fn test_login_then_established() {
        let mut h = Harness::new();
        assert_eq!(h.engine.state(), ClientState::Disconnected);

        h.tick(0);
        assert_eq!(h.engine.state(), ClientState::LoginSent);
        assert_eq!(h.sent(), vec![Message::ClientLogin(TunnelAddresses::default())]);

        h.from_server(&confirmation(), 1);
        assert_eq!(h.engine.state(), ClientState::Established);
        assert_eq!(h.engine.assigned().unwrap().ipv4, Some(Ipv4Addr::new(10, 7, 0, 2)));
    }

    #[test]
    fn test_login_retried_every_keepalive() {
        let mut h = Harness::new();
        h.tick(0);
        h.sent();
        h.tick(5);
        assert!(h.sent().is_empty());
        h.tick(13);
        assert_eq!(h.sent().len(), 1);
        assert_eq!(h.engine.state(), ClientState::LoginSent);

        // No answer at all: give up and start over with a fresh session
        h.tick(61);
        assert_eq!(h.engine.state(), ClientState::Disconnected);
        assert!(h.engine.session().is_none());
        assert_eq!(
            h.engine.take_host_requests(),
            vec![HostRequest::Resolve {
                host: "192.0.2.1:1414".into(),
                current: SocketAddr::from(SERVER),
            }]
        );
    }

    #[test]
    fn test_timeout_then_relogin_on_next_tick() {
        let mut h = Harness::new();
        h.tick(0);
        h.from_server(&confirmation(), 1);
        h.sent();

        h.tick(14);
        assert!(matches!(h.sent().as_slice(), [Message::EchoRequest(_)]));

        h.tick(62);
        assert_eq!(h.engine.state(), ClientState::Disconnected);
        assert!(h.sent().is_empty());
        assert!(h.engine.assigned().is_none());

        h.tick(63);
        assert_eq!(h.engine.state(), ClientState::LoginSent);
        assert_eq!(h.sent(), vec![Message::ClientLogin(TunnelAddresses::default())]);
        // The new session starts clean
        assert_eq!(h.engine.session().unwrap().rx_packets, 0);
    }

    #[test]
    fn test_keepalive_and_ack() {
        let mut h = Harness::new();
        h.tick(0);
        h.from_server(&confirmation(), 1);
        h.sent();

        h.tick(2);
        let echo = match h.sent().as_slice() {
            [Message::EchoRequest(echo)] => *echo,
            other => panic!("unexpected {:?}", other),
        };
        h.tick(3);
        assert!(h.sent().is_empty());

        h.from_server(&Message::EchoAck(echo), 4);
        assert_eq!(h.engine.session().unwrap().last_echo_acked, Some(echo.id));

        h.from_server(&Message::EchoRequest(Echo { id: 9, timestamp_ms: 0 }), 5);
        assert_eq!(h.sent(), vec![Message::EchoAck(Echo { id: 9, timestamp_ms: 0 })]);
    }

    #[test]
    fn test_data_paths() {
        let mut h = Harness::new();
        let pkt = ipv4_packet([10, 7, 0, 2], [192, 168, 1, 5]);
        let mut io = Io {
            device: &mut h.device,
            socket: &h.socket,
        };
        h.engine.on_device_packet(&mut io, &pkt, h.start);
        assert!(h.sent().is_empty());

        h.tick(0);
        h.from_server(&confirmation(), 1);
        h.sent();
        let mut io = Io {
            device: &mut h.device,
            socket: &h.socket,
        };
        h.engine.on_device_packet(&mut io, &pkt, h.start);
        assert_eq!(h.sent(), vec![Message::Data(pkt.clone())]);

        let inbound = ipv4_packet([192, 168, 1, 5], [10, 7, 0, 2]);
        h.from_server(&Message::Data(inbound.clone()), 2);
        assert_eq!(h.device.written, vec![inbound]);
    }

    #[test]
    fn test_route_advertise_installs_once() {
        let mut h = Harness::new();
        h.tick(0);
        let route = "192.168.1.0/24=10.7.0.1".parse().unwrap();
        h.from_server(&Message::RouteAdvertise(vec![route]), 1);
        h.from_server(&Message::RouteAdvertise(vec![route]), 2);
        assert_eq!(h.engine.routes().len(), 1);
        assert_eq!(h.engine.take_host_requests(), vec![HostRequest::InstallRoute(route)]);
        assert!(h.engine.take_host_requests().is_empty());
    }

    #[test]
    fn test_invalid_input_never_changes_state() {
        let mut h = Harness::new();
        h.tick(0);
        h.from_server(&confirmation(), 1);

        let stranger = SocketAddr::from(([198, 51, 100, 1], 1414));
        let good = h.codec.encode(&Message::Disconnect).unwrap();
        h.raw(&good, stranger, 2);
        let wrong_key = codec("other").encode(&Message::Disconnect).unwrap();
        h.raw(&wrong_key, SocketAddr::from(SERVER), 2);
        h.raw(&[0x56, 0x54, 0x01], SocketAddr::from(SERVER), 2);

        assert_eq!(h.engine.state(), ClientState::Established);
        assert_eq!(h.engine.counters().dropped_unknown, 1);
        assert_eq!(h.engine.counters().dropped_auth, 1);
        assert_eq!(h.engine.counters().dropped_format, 1);
        assert_eq!(h.engine.session().unwrap().last_recv, h.at(1));
    }

    #[test]
    fn test_server_disconnect() {
        let mut h = Harness::new();
        h.tick(0);
        h.from_server(&confirmation(), 1);
        h.from_server(&Message::Disconnect, 2);
        assert_eq!(h.engine.state(), ClientState::Disconnected);
        assert!(h.engine.take_host_requests().is_empty());
        h.sent();
        h.tick(3);
        assert_eq!(h.sent(), vec![Message::ClientLogin(TunnelAddresses::default())]);
    }

    #[test]
    fn test_resolved_address_replaces_server() {
        let mut h = Harness::new();
        let moved = SocketAddr::from(([192, 0, 2, 99], 1414));
        h.engine.on_host_outcome(HostOutcome::Resolved(moved));
        assert_eq!(h.engine.server(), moved);
        h.engine.on_host_outcome(HostOutcome::Failed("dns".into()));
        assert_eq!(h.engine.server(), moved);
    }

    #[test]
    fn test_shutdown_and_status() {
        let mut h = Harness::new();
        h.tick(0);
        h.from_server(&confirmation(), 1);
        h.sent();
        let status = h.engine.status(h.at(2));
        assert_eq!(status.state.as_deref(), Some("established"));
        assert_eq!(status.sessions.len(), 1);

        let mut io = Io {
            device: &mut h.device,
            socket: &h.socket,
        };
        h.engine.on_shutdown(&mut io);
        assert_eq!(h.sent(), vec![Message::Disconnect]);
        assert_eq!(h.engine.state(), ClientState::Disconnected);
    }
}
