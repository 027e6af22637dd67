//! Status snapshots
//!
//! The event loop periodically writes a JSON snapshot of the running tunnel
//! so `vtunnel status` can show it without talking to the daemon.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::peer::SessionStatus;
use crate::Result;

/// Datagram and packet counters kept by an engine
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    /// Header or body structure was wrong
    pub dropped_format: u64,
    /// Digest mismatch or bad padding
    pub dropped_auth: u64,
    /// Valid datagram from a source we have no session for
    pub dropped_unknown: u64,
    /// No peer or route for the packet's destination
    pub dropped_unroutable: u64,
    pub device_writes: u64,
    pub relayed: u64,
}

/// Snapshot written to the status file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelStatus {
    /// `server` or `client`
    pub mode: String,
    pub interface: String,
    /// Client state, absent on the server
    #[serde(default)]
    pub state: Option<String>,
    /// Client: the server's transport address
    #[serde(default)]
    pub server: Option<String>,
    pub encrypted: bool,
    pub uptime_secs: u64,
    pub sessions: Vec<SessionStatus>,
    #[serde(default)]
    pub routes: Vec<String>,
    pub counters: Counters,
}

impl TunnelStatus {
    /// Write atomically: a reader never sees a half-written file
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Human readable summary for `vtunnel status`
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "vtunnel {} on {} ({}), up {}s\n",
            self.mode,
            self.interface,
            if self.encrypted { "encrypted" } else { "PLAINTEXT" },
            self.uptime_secs
        ));
        if let Some(state) = &self.state {
            out.push_str(&format!(
                "state: {} server: {}\n",
                state,
                self.server.as_deref().unwrap_or("-")
            ));
        }
        out.push_str(&format!("sessions: {}\n", self.sessions.len()));
        for s in &self.sessions {
            out.push_str(&format!(
                "  {:<24} {:<15} {:<20} idle {:>4}s  rx {}/{}B  tx {}/{}B\n",
                s.endpoint,
                s.ipv4.as_deref().unwrap_or("-"),
                s.ipv6.as_deref().unwrap_or("-"),
                s.idle_secs,
                s.rx_packets,
                s.rx_bytes,
                s.tx_packets,
                s.tx_bytes
            ));
        }
        if !self.routes.is_empty() {
            out.push_str("routes:\n");
            for r in &self.routes {
                out.push_str(&format!("  {}\n", r));
            }
        }
        let c = &self.counters;
        out.push_str(&format!(
            "datagrams in {} out {}, dropped format {} auth {} unknown {} unroutable {}, relayed {}\n",
            c.datagrams_in,
            c.datagrams_out,
            c.dropped_format,
            c.dropped_auth,
            c.dropped_unknown,
            c.dropped_unroutable,
            c.relayed
        ));
        out
    }
}
