//! Route table for vtunnel
//!
//! An in-memory set of `(network, prefix, gateway)` entries. The server
//! uses it to pick which peer owns a destination and to build route
//! advertisements; the client installs what the server advertises.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::{Error, Result};

/// Longest accepted textual route expression
const MAX_ROUTE_EXPR_LEN: usize = 96;

/// A single route: traffic for `network` goes via `gateway`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub network: IpNet,
    pub gateway: IpAddr,
}

impl RouteEntry {
    /// Build a validated entry. The prefix must suit the address family
    /// and the gateway must share the network's family.
    pub fn new(network: IpAddr, prefix_len: u8, gateway: IpAddr) -> Result<Self> {
        if network.is_ipv4() != gateway.is_ipv4() {
            return Err(Error::InvalidRoute(format!(
                "{}/{}={}: gateway family does not match network",
                network, prefix_len, gateway
            )));
        }
        let net = IpNet::new(network, prefix_len).map_err(|_| {
            Error::InvalidRoute(format!("{}/{}: prefix length out of range", network, prefix_len))
        })?;
        Ok(Self {
            network: net.trunc(),
            gateway,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.network.contains(addr)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.network, IpNet::V4(_))
    }
}

impl FromStr for RouteEntry {
    type Err = Error;

    /// Parse `network/prefix=gateway`, e.g. `192.168.0.0/16=10.7.0.1`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidRoute(format!("not a valid route expression '{}'", s));

        if s.len() > MAX_ROUTE_EXPR_LEN {
            return Err(invalid());
        }
        let (net_part, gateway) = s.trim().split_once('=').ok_or_else(invalid)?;
        let (network, prefix) = net_part.split_once('/').ok_or_else(invalid)?;

        let network: IpAddr = network.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        let gateway: IpAddr = gateway.trim().parse().map_err(|_| invalid())?;

        Self::new(network, prefix, gateway)
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.network, self.gateway)
    }
}

/// Ordered route entries with longest-prefix-match lookup
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a route
    pub fn add(&mut self, network: IpAddr, prefix_len: u8, gateway: IpAddr) -> Result<()> {
        let entry = RouteEntry::new(network, prefix_len, gateway)?;
        self.insert(entry);
        Ok(())
    }

    /// Add an already validated entry. Re-adding an identical entry moves
    /// it to the most-recent position. Returns true if it was new.
    pub fn insert(&mut self, entry: RouteEntry) -> bool {
        let existed = match self.entries.iter().position(|e| *e == entry) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        };
        self.entries.push(entry);
        !existed
    }

    /// Longest-prefix match. Among equal prefixes the most recently added
    /// entry wins.
    pub fn lookup_entry(&self, destination: &IpAddr) -> Option<&RouteEntry> {
        let mut best: Option<&RouteEntry> = None;
        for entry in &self.entries {
            if !entry.contains(destination) {
                continue;
            }
            if best.map_or(true, |b| entry.prefix_len() >= b.prefix_len()) {
                best = Some(entry);
            }
        }
        best
    }

    /// Gateway for `destination`, if any route covers it
    pub fn lookup(&self, destination: &IpAddr) -> Option<IpAddr> {
        self.lookup_entry(destination).map(|e| e.gateway)
    }

    pub fn all(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
