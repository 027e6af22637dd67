//! Peer session tracking for vtunnel
//!
//! A [`PeerSession`] records one remote tunnel endpoint: where it lives on
//! the transport, which virtual addresses it holds, and when we last heard
//! from it. The server keeps many in a [`SessionTable`]; the client keeps
//! exactly one for the server.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::packet::{Echo, TunnelAddresses};
use crate::route::RouteEntry;

/// State for one remote endpoint
#[derive(Debug, Clone)]
pub struct PeerSession {
    /// Transport address (ip:port) the peer sends from
    pub endpoint: SocketAddr,
    /// Virtual addresses assigned to this peer
    pub addresses: TunnelAddresses,
    pub created: Instant,
    /// Last time a valid datagram arrived from this peer
    pub last_recv: Instant,
    /// Last time we sent a keepalive probe (client side)
    pub last_keepalive: Option<Instant>,
    next_echo_id: u32,
    /// Highest echo id the peer acknowledged
    pub last_echo_acked: Option<u32>,
    /// Server side: routes whose gateway is this peer
    pub owned_routes: Vec<RouteEntry>,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl PeerSession {
    pub fn new(endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            endpoint,
            addresses: TunnelAddresses::default(),
            created: now,
            last_recv: now,
            last_keepalive: None,
            next_echo_id: 1,
            last_echo_acked: None,
            owned_routes: Vec::new(),
            rx_packets: 0,
            tx_packets: 0,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Refresh liveness after a valid datagram of `len` bytes
    pub fn touch(&mut self, now: Instant, len: usize) {
        self.last_recv = now;
        self.rx_packets += 1;
        self.rx_bytes += len as u64;
    }

    pub fn record_tx(&mut self, len: usize) {
        self.tx_packets += 1;
        self.tx_bytes += len as u64;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_recv)
    }

    pub fn is_expired(&self, now: Instant, threshold: Duration) -> bool {
        self.idle_for(now) > threshold
    }

    /// Whether a keepalive is due at `now`
    pub fn keepalive_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_keepalive
            .map_or(true, |t| now.saturating_duration_since(t) >= interval)
    }

    /// Build the next keepalive probe and record that it was sent
    pub fn next_echo(&mut self, now: Instant, timestamp_ms: u64) -> Echo {
        let id = self.next_echo_id;
        self.next_echo_id = self.next_echo_id.wrapping_add(1);
        self.last_keepalive = Some(now);
        Echo { id, timestamp_ms }
    }

    /// Record an acknowledged probe. Stale or duplicate acks are ignored.
    pub fn ack_echo(&mut self, echo: &Echo) -> bool {
        if self.last_echo_acked.map_or(true, |last| echo.id > last) {
            self.last_echo_acked = Some(echo.id);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self, now: Instant) -> SessionStatus {
        SessionStatus {
            endpoint: self.endpoint.to_string(),
            ipv4: self.addresses.ipv4.map(|a| a.to_string()),
            ipv6: self.addresses.ipv6.map(|a| a.to_string()),
            idle_secs: self.idle_for(now).as_secs(),
            uptime_secs: now.saturating_duration_since(self.created).as_secs(),
            routes: self.owned_routes.iter().map(|r| r.to_string()).collect(),
            rx_packets: self.rx_packets,
            tx_packets: self.tx_packets,
            rx_bytes: self.rx_bytes,
            tx_bytes: self.tx_bytes,
        }
    }
}

/// Status of a single session, as written to the status file
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct SessionStatus {
    pub endpoint: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub idle_secs: u64,
    pub uptime_secs: u64,
    #[serde(default)]
    pub routes: Vec<String>,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Server-side sessions keyed by transport source address
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, PeerSession>,
    /// Virtual address → endpoint, for routing packets to peers
    by_virtual: HashMap<IpAddr, SocketAddr>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, endpoint: &SocketAddr) -> Option<&PeerSession> {
        self.sessions.get(endpoint)
    }

    pub fn get_mut(&mut self, endpoint: &SocketAddr) -> Option<&mut PeerSession> {
        self.sessions.get_mut(endpoint)
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.sessions.contains_key(endpoint)
    }

    /// Look up the session for `endpoint`, creating a fresh one if needed.
    /// The flag is true when the session was just created.
    pub fn get_or_insert(&mut self, endpoint: SocketAddr, now: Instant) -> (&mut PeerSession, bool) {
        let mut created = false;
        let session = self.sessions.entry(endpoint).or_insert_with(|| {
            created = true;
            PeerSession::new(endpoint, now)
        });
        if created {
            info!("New session from {}", endpoint);
        }
        (session, created)
    }

    /// Endpoint of the live session holding virtual address `addr`
    pub fn endpoint_for(&self, addr: &IpAddr) -> Option<SocketAddr> {
        self.by_virtual.get(addr).copied()
    }

    /// True if another session than `except` holds `addr`
    pub fn is_address_taken(&self, addr: &IpAddr, except: &SocketAddr) -> bool {
        self.by_virtual.get(addr).map_or(false, |owner| owner != except)
    }

    /// Replace the virtual addresses of the session at `endpoint`
    pub fn set_addresses(&mut self, endpoint: &SocketAddr, addresses: TunnelAddresses) -> bool {
        let Some(session) = self.sessions.get_mut(endpoint) else {
            return false;
        };
        for old in session.addresses.to_vec() {
            if self.by_virtual.get(&old) == Some(endpoint) {
                self.by_virtual.remove(&old);
            }
        }
        session.addresses = addresses;
        for new in addresses.to_vec() {
            self.by_virtual.insert(new, *endpoint);
        }
        true
    }

    pub fn remove(&mut self, endpoint: &SocketAddr) -> Option<PeerSession> {
        let session = self.sessions.remove(endpoint)?;
        for addr in session.addresses.to_vec() {
            if self.by_virtual.get(&addr) == Some(endpoint) {
                self.by_virtual.remove(&addr);
            }
        }
        Some(session)
    }

    /// Remove and return every session idle for longer than `threshold`
    pub fn expire(&mut self, now: Instant, threshold: Duration) -> Vec<PeerSession> {
        let stale: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now, threshold))
            .map(|s| s.endpoint)
            .collect();
        let mut removed = Vec::with_capacity(stale.len());
        for endpoint in stale {
            if let Some(session) = self.remove(&endpoint) {
                debug!("Session {} idle for {:?}", endpoint, session.idle_for(now));
                removed.push(session);
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn status(&self, now: Instant) -> Vec<SessionStatus> {
        let mut out: Vec<SessionStatus> = self.sessions.values().map(|s| s.snapshot(now)).collect();
        out.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 7], port))
    }

    fn addrs(last: u8) -> TunnelAddresses {
        TunnelAddresses {
            ipv4: Some(Ipv4Addr::new(10, 7, 0, last)),
            ipv6: None,
        }
    }

    #[test]
    fn test_get_or_insert_creates_once() {
        let now = Instant::now();
        let mut table = SessionTable::new();
        let (_, created) = table.get_or_insert(ep(4000), now);
        assert!(created);
        let (_, created) = table.get_or_insert(ep(4000), now);
        assert!(!created);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_virtual_address_index() {
        let now = Instant::now();
        let mut table = SessionTable::new();
        table.get_or_insert(ep(1), now);
        table.get_or_insert(ep(2), now);
        assert!(table.set_addresses(&ep(1), addrs(2)));

        let v = IpAddr::V4(Ipv4Addr::new(10, 7, 0, 2));
        assert_eq!(table.endpoint_for(&v), Some(ep(1)));
        assert!(table.is_address_taken(&v, &ep(2)));
        assert!(!table.is_address_taken(&v, &ep(1)));

        // Reassigning drops the old index entry
        table.set_addresses(&ep(1), addrs(3));
        assert_eq!(table.endpoint_for(&v), None);

        table.remove(&ep(1));
        assert_eq!(table.endpoint_for(&IpAddr::V4(Ipv4Addr::new(10, 7, 0, 3))), None);
        assert!(!table.set_addresses(&ep(9), addrs(4)));
    }

    #[test]
    fn test_expire_removes_only_stale() {
        let start = Instant::now();
        let mut table = SessionTable::new();
        table.get_or_insert(ep(1), start);
        table.get_or_insert(ep(2), start);
        table.set_addresses(&ep(1), addrs(2));

        let later = start + Duration::from_secs(30);
        table.get_mut(&ep(2)).unwrap().touch(later, 10);

        let removed = table.expire(later + Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].endpoint, ep(1));
        assert!(table.contains(&ep(2)));
        assert_eq!(table.endpoint_for(&IpAddr::V4(Ipv4Addr::new(10, 7, 0, 2))), None);
    }

    #[test]
    fn test_keepalive_bookkeeping() {
        let start = Instant::now();
        let interval = Duration::from_secs(10);
        let mut session = PeerSession::new(ep(1), start);
        assert!(session.keepalive_due(start, interval));

        let echo = session.next_echo(start, 42);
        assert_eq!(echo.id, 1);
        assert!(!session.keepalive_due(start + Duration::from_secs(5), interval));
        assert!(session.keepalive_due(start + interval, interval));

        assert!(session.ack_echo(&echo));
        assert!(!session.ack_echo(&echo));
        assert_eq!(session.next_echo(start, 43).id, 2);
    }

    #[test]
    fn test_snapshot() {
        let now = Instant::now();
        let mut session = PeerSession::new(ep(1), now);
        session.addresses = addrs(5);
        session.touch(now, 100);
        session.record_tx(60);

        let status = session.snapshot(now);
        assert_eq!(status.ipv4.as_deref(), Some("10.7.0.5"));
        assert_eq!(status.rx_bytes, 100);
        assert_eq!(status.tx_packets, 1);
    }
}
