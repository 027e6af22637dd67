//! Server engine
//!
//! Owns one [`PeerSession`](crate::peer::PeerSession) per remote transport
//! address, hands out virtual addresses, pushes routes, and moves packets
//! between the kernel interface and the right peer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::event_loop::{Engine, Io};
use crate::packet::{Codec, Message, TunnelAddresses};
use crate::peer::SessionTable;
use crate::route::{RouteEntry, RouteTable};
use crate::status::{Counters, TunnelStatus};
use crate::transport;
use crate::tun;
use crate::Error;

/// Server engine settings taken from the tunnel configuration
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// The server's own virtual addresses; never handed out
    pub own: TunnelAddresses,
    pub pool: Option<Ipv4Net>,
    pub session_expiry: Duration,
    pub relay: bool,
    pub implicit_login: bool,
    pub route_advertise: bool,
    pub interface: String,
}

impl ServerOptions {
    pub fn from_config(config: &TunnelConfig, interface: &str) -> Self {
        Self {
            own: config.tunnel_addresses(),
            pool: config.effective_pool(),
            session_expiry: config.session_expiry,
            relay: config.relay,
            implicit_login: config.implicit_login,
            route_advertise: config.route_advertise,
            interface: interface.to_string(),
        }
    }
}

pub struct ServerEngine {
    codec: Codec,
    options: ServerOptions,
    sessions: SessionTable,
    routes: RouteTable,
    counters: Counters,
    started: Instant,
}

impl ServerEngine {
    pub fn new(codec: Codec, routes: RouteTable, options: ServerOptions, now: Instant) -> Self {
        info!(
            "Server engine ready: {} route(s), pool {}, relay {}",
            routes.len(),
            options.pool.map_or_else(|| "none".to_string(), |p| p.to_string()),
            if options.relay { "on" } else { "off" }
        );
        Self {
            codec,
            options,
            sessions: SessionTable::new(),
            routes,
            counters: Counters::default(),
            started: now,
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    fn send(&mut self, io: &mut Io<'_>, message: &Message, to: SocketAddr) {
        match transport::send_message(io.socket, &self.codec, message, to) {
            Ok(n) => {
                self.counters.datagrams_out += 1;
                if let Some(session) = self.sessions.get_mut(&to) {
                    session.record_tx(n);
                }
            }
            Err(e) => warn!("Send to {} failed: {}", to, e),
        }
    }

    fn write_device(&mut self, io: &mut Io<'_>, packet: &[u8]) {
        match io.device.write_packet(packet) {
            Ok(()) => self.counters.device_writes += 1,
            Err(e) => warn!("TUN write error: {}", e),
        }
    }

    /// Endpoint of the live peer that should receive traffic for `dst`:
    /// a peer's own virtual address first, then a route whose gateway is
    /// a peer.
    fn peer_for(&self, dst: &IpAddr) -> Option<SocketAddr> {
        self.sessions.endpoint_for(dst).or_else(|| {
            self.routes
                .lookup(dst)
                .and_then(|gateway| self.sessions.endpoint_for(&gateway))
        })
    }

    /// Pool member other than the server's own address. Another session
    /// may still hold it.
    fn is_pool_address(&self, addr: Ipv4Addr) -> bool {
        let in_pool = self.options.pool.map_or(true, |pool| {
            pool.contains(&addr) && addr != pool.network() && addr != pool.broadcast()
        });
        in_pool && !self.options.own.contains(&IpAddr::V4(addr))
    }

    /// Confirm the requested IPv4 address, keep the current one, or take
    /// the first free pool address
    fn assign_ipv4(&self, requested: Option<Ipv4Addr>, endpoint: &SocketAddr) -> Option<Ipv4Addr> {
        if let Some(addr) = requested {
            if self.is_pool_address(addr) {
                return Some(addr);
            }
            debug!("Requested address {} for {} not available", addr, endpoint);
        }
        if let Some(current) = self.sessions.get(endpoint).and_then(|s| s.addresses.ipv4) {
            return Some(current);
        }
        let pool = self.options.pool?;
        pool.hosts().find(|host| {
            self.is_pool_address(*host) && !self.sessions.is_address_taken(&IpAddr::V4(*host), endpoint)
        })
    }

    fn assign_ipv6(&self, requested: Option<Ipv6Addr>, endpoint: &SocketAddr) -> Option<Ipv6Addr> {
        let addr = requested?;
        if self.options.own.contains(&IpAddr::V6(addr)) {
            debug!("Requested address {} for {} not available", addr, endpoint);
            return None;
        }
        Some(addr)
    }

    /// Drop any other session holding one of `addresses`. A peer that
    /// comes back from a new transport address reclaims its virtual
    /// address from the stale session.
    fn reclaim(&mut self, addresses: &TunnelAddresses, endpoint: &SocketAddr) {
        for addr in addresses.to_vec() {
            let Some(holder) = self.sessions.endpoint_for(&addr) else {
                continue;
            };
            if holder == *endpoint {
                continue;
            }
            if self.sessions.remove(&holder).is_some() {
                info!("Address {} moved from {} to {}", addr, holder, endpoint);
            }
        }
    }

    /// Routes a peer may use: everything not pointing back at itself
    fn routes_for(&self, addresses: &TunnelAddresses) -> Vec<RouteEntry> {
        self.routes
            .all()
            .iter()
            .filter(|r| !addresses.contains(&r.gateway))
            .copied()
            .collect()
    }

    fn handle_login(&mut self, io: &mut Io<'_>, from: SocketAddr, requested: TunnelAddresses, len: usize, now: Instant) {
        let assigned = TunnelAddresses {
            ipv4: self.assign_ipv4(requested.ipv4, &from),
            ipv6: self.assign_ipv6(requested.ipv6, &from),
        };
        if assigned.is_empty() {
            warn!("No virtual address available for {}, refusing login", from);
            self.sessions.remove(&from);
            self.send(io, &Message::Disconnect, from);
            return;
        }

        self.reclaim(&assigned, &from);
        let (session, created) = self.sessions.get_or_insert(from, now);
        session.touch(now, len);
        let changed = session.addresses != assigned;
        self.sessions.set_addresses(&from, assigned);

        let owned: Vec<RouteEntry> = self
            .routes
            .all()
            .iter()
            .filter(|r| assigned.contains(&r.gateway))
            .copied()
            .collect();
        if let Some(session) = self.sessions.get_mut(&from) {
            session.owned_routes = owned;
        }

        if created || changed {
            info!(
                "Peer {} logged in as {}{}",
                from,
                assigned.ipv4.map_or_else(|| "-".to_string(), |a| a.to_string()),
                assigned.ipv6.map_or_else(String::new, |a| format!(" / {}", a))
            );
        }

        self.send(io, &Message::ClientLogin(assigned), from);

        if self.options.route_advertise {
            let routes = self.routes_for(&assigned);
            if !routes.is_empty() {
                for message in self.codec.route_advertisements(&routes) {
                    self.send(io, &message, from);
                }
                debug!("Advertised {} route(s) to {}", routes.len(), from);
            }
        }
    }

    /// Create a session from the first DATA of an unknown source, using
    /// the inner packet's source address as its virtual address
    fn implicit_login(&mut self, from: SocketAddr, packet: &[u8], now: Instant) -> bool {
        let Some(src) = tun::source(packet) else {
            return false;
        };
        if self.options.own.contains(&src) {
            debug!("Implicit login from {} as {} refused: server address", from, src);
            return false;
        }
        let addresses = match src {
            IpAddr::V4(v4) => TunnelAddresses {
                ipv4: Some(v4),
                ipv6: None,
            },
            IpAddr::V6(v6) => TunnelAddresses {
                ipv4: None,
                ipv6: Some(v6),
            },
        };
        self.reclaim(&addresses, &from);
        self.sessions.get_or_insert(from, now);
        self.sessions.set_addresses(&from, addresses);
        info!("Peer {} joined implicitly as {}", from, src);
        true
    }

    fn handle_data(&mut self, io: &mut Io<'_>, from: SocketAddr, packet: Vec<u8>, len: usize, now: Instant) {
        if !self.sessions.contains(&from) {
            if !self.options.implicit_login || !self.implicit_login(from, &packet, now) {
                debug!("DATA from unknown peer {} dropped", from);
                self.counters.dropped_unknown += 1;
                return;
            }
        }
        if let Some(session) = self.sessions.get_mut(&from) {
            session.touch(now, len);
        }

        if self.options.relay {
            if let Some(dst) = tun::destination(&packet) {
                if let Some(peer) = self.peer_for(&dst) {
                    if peer != from {
                        debug!("Relaying {} bytes from {} to {}", packet.len(), from, peer);
                        self.counters.relayed += 1;
                        self.send(io, &Message::Data(packet), peer);
                        return;
                    }
                }
            }
        }

        self.write_device(io, &packet);
    }

    /// Forget all peers; used on shutdown
    fn disconnect_all(&mut self, io: &mut Io<'_>) {
        let endpoints: Vec<SocketAddr> = self.sessions.iter().map(|s| s.endpoint).collect();
        for endpoint in endpoints {
            self.send(io, &Message::Disconnect, endpoint);
            self.sessions.remove(&endpoint);
        }
    }
}

impl Engine for ServerEngine {
    fn on_device_packet(&mut self, io: &mut Io<'_>, packet: &[u8], _now: Instant) {
        let Some(dst) = tun::destination(packet) else {
            debug!("Non-IP packet of {} bytes from TUN dropped", packet.len());
            self.counters.dropped_unroutable += 1;
            return;
        };
        let Some(peer) = self.peer_for(&dst) else {
            debug!("No peer for {}", dst);
            self.counters.dropped_unroutable += 1;
            return;
        };
        self.send(io, &Message::Data(packet.to_vec()), peer);
    }

    fn on_datagram(&mut self, io: &mut Io<'_>, datagram: &[u8], from: SocketAddr, now: Instant) {
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
        let len = datagram.len();

        match message {
            Message::ClientLogin(requested) => self.handle_login(io, from, requested, len, now),
            Message::Data(packet) => self.handle_data(io, from, packet, len, now),
            Message::EchoRequest(echo) => {
                if let Some(session) = self.sessions.get_mut(&from) {
                    session.touch(now, len);
                    self.send(io, &Message::EchoAck(echo), from);
                } else {
                    debug!("Keepalive from unknown peer {}, asking it to log in again", from);
                    self.counters.dropped_unknown += 1;
                    self.send(io, &Message::Disconnect, from);
                }
            }
            Message::EchoAck(echo) => {
                if let Some(session) = self.sessions.get_mut(&from) {
                    session.touch(now, len);
                    session.ack_echo(&echo);
                }
            }
            Message::RouteAdvertise(_) => {
                debug!("Ignoring route advertisement from {}", from);
                if let Some(session) = self.sessions.get_mut(&from) {
                    session.touch(now, len);
                }
            }
            Message::Disconnect => {
                if self.sessions.remove(&from).is_some() {
                    info!("Peer {} disconnected", from);
                }
            }
        }
    }

    fn on_tick(&mut self, _io: &mut Io<'_>, now: Instant) {
        for session in self.sessions.expire(now, self.options.session_expiry) {
            info!(
                "Session {} expired after {}s of silence",
                session.endpoint,
                session.idle_for(now).as_secs()
            );
        }
    }

    fn on_shutdown(&mut self, io: &mut Io<'_>) {
        self.disconnect_all(io);
    }

    fn status(&self, now: Instant) -> TunnelStatus {
        TunnelStatus {
            mode: "server".into(),
            interface: self.options.interface.clone(),
            state: None,
            server: None,
            encrypted: self.codec.crypto().is_encrypted(),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            sessions: self.sessions.status(now),
            routes: self.routes.all().iter().map(|r| r.to_string()).collect(),
            counters: self.counters,
        }
    }
}
