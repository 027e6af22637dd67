//! vtunnel Configuration
//!
//! Settings arrive from an optional TOML file and from the command line.
//! Both produce a [`RawConfig`]; the merged result is validated once by
//! [`TunnelConfig::from_raw`] and never changes afterwards.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::crypto::Crypto;
use crate::netconf::InterfaceAddress;
use crate::packet::TunnelAddresses;
use crate::route::{RouteEntry, RouteTable};
use crate::transport;
use crate::tun::MAX_IFNAME_LEN;
use crate::{Error, Result};

/// Unvalidated settings, as written in the TOML file or given on the
/// command line. Every field is optional so the two sources can be merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    /// Server mode: address to listen on (host:port)
    pub local: Option<String>,

    /// Client mode: server to connect to (host:port)
    pub remote: Option<String>,

    /// `a.b.c.d/prefix` or a point-to-point pair `a.b.c.d/e.f.g.h`
    pub ipv4_addr: Option<String>,

    /// `addr/prefix`
    pub ipv6_addr: Option<String>,

    pub mtu: Option<u16>,

    /// Keepalive interval in seconds
    pub keepalive: Option<u64>,

    /// Seconds without a valid datagram before the client reconnects
    pub reconnect_timeout: Option<u64>,

    /// Seconds without a valid datagram before the server drops a session
    pub session_expiry: Option<u64>,

    /// Interface name, may contain `%d`
    pub ifname: Option<String>,

    pub pidfile: Option<PathBuf>,

    pub encryption_key: Option<String>,

    pub no_encryption: bool,

    /// Routes in `network/prefix=gateway` form
    pub routes: Vec<String>,

    pub relay: bool,

    pub implicit_login: Option<bool>,

    pub route_advertise: Option<bool>,

    /// Pool of IPv4 addresses handed to clients
    pub address_pool: Option<String>,

    pub status_file: Option<PathBuf>,
}

fn default_mtu() -> u16 {
    1416
}

fn default_keepalive() -> u64 {
    13
}

fn default_reconnect_timeout() -> u64 {
    60
}

fn default_ifname() -> String {
    "vt%d".to_string()
}

impl RawConfig {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Parse settings from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `overrides` on top of `self`. Set options win, flags are
    /// combined and routes are appended.
    pub fn merge(mut self, overrides: RawConfig) -> Self {
        fn take<T>(base: &mut Option<T>, over: Option<T>) {
            if over.is_some() {
                *base = over;
            }
        }
        take(&mut self.local, overrides.local);
        take(&mut self.remote, overrides.remote);
        take(&mut self.ipv4_addr, overrides.ipv4_addr);
        take(&mut self.ipv6_addr, overrides.ipv6_addr);
        take(&mut self.mtu, overrides.mtu);
        take(&mut self.keepalive, overrides.keepalive);
        take(&mut self.reconnect_timeout, overrides.reconnect_timeout);
        take(&mut self.session_expiry, overrides.session_expiry);
        take(&mut self.ifname, overrides.ifname);
        take(&mut self.pidfile, overrides.pidfile);
        take(&mut self.encryption_key, overrides.encryption_key);
        take(&mut self.implicit_login, overrides.implicit_login);
        take(&mut self.route_advertise, overrides.route_advertise);
        take(&mut self.address_pool, overrides.address_pool);
        take(&mut self.status_file, overrides.status_file);
        self.no_encryption |= overrides.no_encryption;
        self.relay |= overrides.relay;
        self.routes.extend(overrides.routes);
        self
    }
}

/// Which side of the tunnel this process runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Server { listen: SocketAddr },
    /// `host` is kept for re-resolution after a reconnect timeout
    Client { server: SocketAddr, host: String },
}

/// Pre-shared passphrase, or explicitly none
#[derive(Clone, PartialEq, Eq)]
pub enum Passphrase {
    Secret(String),
    Disabled,
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Passphrase::Secret(_) => f.write_str("Secret(<redacted>)"),
            Passphrase::Disabled => f.write_str("Disabled"),
        }
    }
}

/// Validated, immutable tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub mode: Mode,
    pub ipv4: Option<InterfaceAddress>,
    pub ipv6: Option<InterfaceAddress>,
    pub mtu: u16,
    pub keepalive: Duration,
    pub reconnect_timeout: Duration,
    pub session_expiry: Duration,
    pub ifname: String,
    pub pidfile: Option<PathBuf>,
    pub passphrase: Passphrase,
    pub routes: Vec<RouteEntry>,
    pub relay: bool,
    pub implicit_login: bool,
    pub route_advertise: bool,
    pub address_pool: Option<Ipv4Net>,
    pub status_file: Option<PathBuf>,
}

impl TunnelConfig {
    /// Validate raw settings. Host names are resolved here, before any
    /// socket or device exists.
    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        let mode = match (raw.local.as_deref(), raw.remote.as_deref()) {
            (Some(local), None) => Mode::Server {
                listen: transport::resolve(local, None)?,
            },
            (None, Some(remote)) => Mode::Client {
                server: transport::resolve(remote, None)?,
                host: remote.to_string(),
            },
            (Some(_), Some(_)) => {
                return Err(Error::Config("--local and --remote are mutually exclusive".into()))
            }
            (None, None) => {
                return Err(Error::Config("one of --local or --remote is required".into()))
            }
        };

        let ipv4 = raw.ipv4_addr.as_deref().map(parse_ipv4_addr).transpose()?;
        let ipv6 = raw.ipv6_addr.as_deref().map(parse_ipv6_addr).transpose()?;

        let mtu = raw.mtu.unwrap_or_else(default_mtu);
        let min_mtu = if ipv6.is_some() { 1280 } else { 576 };
        if !(min_mtu..=9000).contains(&mtu) {
            return Err(Error::Config(format!(
                "MTU {} out of range {}..=9000",
                mtu, min_mtu
            )));
        }

        let keepalive = raw.keepalive.unwrap_or_else(default_keepalive);
        if keepalive < 1 {
            return Err(Error::Config("keepalive must be at least 1 second".into()));
        }
        let reconnect_timeout = raw.reconnect_timeout.unwrap_or_else(default_reconnect_timeout);
        if reconnect_timeout <= keepalive {
            return Err(Error::Config(format!(
                "reconnect timeout ({}s) must exceed keepalive ({}s)",
                reconnect_timeout, keepalive
            )));
        }
        let session_expiry = raw.session_expiry.unwrap_or(keepalive.saturating_mul(3));
        if session_expiry <= keepalive {
            return Err(Error::Config(format!(
                "session expiry ({}s) must exceed keepalive ({}s)",
                session_expiry, keepalive
            )));
        }

        let ifname = raw.ifname.unwrap_or_else(default_ifname);
        if ifname.is_empty() || ifname.len() > MAX_IFNAME_LEN {
            return Err(Error::Config(format!(
                "interface name '{}' must be 1..={} bytes",
                ifname, MAX_IFNAME_LEN
            )));
        }

        let passphrase = match (raw.encryption_key, raw.no_encryption) {
            (Some(_), true) => {
                return Err(Error::Config(
                    "--encryption-key conflicts with --no-encryption".into(),
                ))
            }
            (Some(key), false) if key.is_empty() => {
                return Err(Error::Config("encryption key must not be empty".into()))
            }
            (Some(key), false) => Passphrase::Secret(key),
            (None, _) => Passphrase::Disabled,
        };

        let routes = raw
            .routes
            .iter()
            .map(|r| r.parse::<RouteEntry>())
            .collect::<Result<Vec<_>>>()?;

        let address_pool = match raw.address_pool.as_deref() {
            Some(pool) => Some(
                pool.parse::<Ipv4Net>()
                    .map_err(|e| Error::Config(format!("invalid address pool '{}': {}", pool, e)))?
                    .trunc(),
            ),
            None => None,
        };

        let pidfile = raw.pidfile.map(absolute_path).transpose()?;
        let status_file = raw.status_file.map(absolute_path).transpose()?;

        Ok(Self {
            mode,
            ipv4,
            ipv6,
            mtu,
            keepalive: Duration::from_secs(keepalive),
            reconnect_timeout: Duration::from_secs(reconnect_timeout),
            session_expiry: Duration::from_secs(session_expiry),
            ifname,
            pidfile,
            passphrase,
            routes,
            relay: raw.relay,
            implicit_login: raw.implicit_login.unwrap_or(true),
            route_advertise: raw.route_advertise.unwrap_or(true),
            address_pool,
            status_file,
        })
    }

    pub fn is_server(&self) -> bool {
        matches!(self.mode, Mode::Server { .. })
    }

    pub fn crypto(&self) -> Crypto {
        match &self.passphrase {
            Passphrase::Secret(key) => Crypto::from_passphrase(Some(key.as_str())),
            Passphrase::Disabled => Crypto::from_passphrase(None),
        }
    }

    /// Configured routes. A point-to-point IPv4 pair adds a default route
    /// through the peer.
    pub fn route_table(&self) -> RouteTable {
        let mut table = RouteTable::new();
        if let Some(InterfaceAddress::Ipv4PointToPoint { peer, .. }) = self.ipv4 {
            if let Ok(default) = RouteEntry::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, IpAddr::V4(peer)) {
                table.insert(default);
            }
        }
        for route in &self.routes {
            table.insert(*route);
        }
        table
    }

    /// Local virtual addresses, as carried in CLIENT_LOGIN
    pub fn tunnel_addresses(&self) -> TunnelAddresses {
        TunnelAddresses {
            ipv4: match self.ipv4 {
                Some(InterfaceAddress::Ipv4 { local, .. })
                | Some(InterfaceAddress::Ipv4PointToPoint { local, .. }) => Some(local),
                _ => None,
            },
            ipv6: match self.ipv6 {
                Some(InterfaceAddress::Ipv6 { local, .. }) => Some(local),
                _ => None,
            },
        }
    }

    pub fn interface_addresses(&self) -> Vec<InterfaceAddress> {
        self.ipv4.into_iter().chain(self.ipv6).collect()
    }

    /// Addresses the server hands out: the explicit pool, else the
    /// network of its own IPv4 address
    pub fn effective_pool(&self) -> Option<Ipv4Net> {
        if self.address_pool.is_some() {
            return self.address_pool;
        }
        match self.ipv4 {
            Some(InterfaceAddress::Ipv4 { local, prefix }) => {
                Ipv4Net::new(local, prefix).ok().map(|net| net.trunc())
            }
            _ => None,
        }
    }
}

/// Relative paths are taken from the startup working directory; a
/// daemon runs from `/`
fn absolute_path(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| Error::Config(format!("cannot resolve {}: {}", path.display(), e)))?;
    Ok(cwd.join(path))
}

fn parse_ipv4_addr(s: &str) -> Result<InterfaceAddress> {
    let (addr, rest) = s
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("'{}': expected a.b.c.d/prefix or a.b.c.d/e.f.g.h", s)))?;
    let local: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Config(format!("'{}': invalid IPv4 address", addr)))?;
    if let Ok(peer) = rest.parse::<Ipv4Addr>() {
        return Ok(InterfaceAddress::Ipv4PointToPoint { local, peer });
    }
    let prefix: u8 = rest
        .parse()
        .map_err(|_| Error::Config(format!("'{}': invalid prefix or peer address", rest)))?;
    if !(1..=30).contains(&prefix) {
        return Err(Error::Config(format!("IPv4 prefix {} out of range 1..=30", prefix)));
    }
    Ok(InterfaceAddress::Ipv4 { local, prefix })
}

fn parse_ipv6_addr(s: &str) -> Result<InterfaceAddress> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("'{}': expected addr/prefix", s)))?;
    let local: Ipv6Addr = addr
        .parse()
        .map_err(|_| Error::Config(format!("'{}': invalid IPv6 address", addr)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::Config(format!("'{}': invalid prefix", prefix)))?;
    if !(1..=128).contains(&prefix) {
        return Err(Error::Config(format!("IPv6 prefix {} out of range 1..=128", prefix)));
    }
    Ok(InterfaceAddress::Ipv6 { local, prefix })
}
