//! vtunnel - Minimal encrypted virtual network tunnel
//!
//! Carries IP packets read from a kernel TUN interface over UDP between a
//! client and a server, encrypted with a key derived from a pre-shared
//! passphrase.
//!
//! # Architecture
//!
//! A single-threaded event loop polls the TUN device and the UDP socket and
//! drives either a [`ServerEngine`] or a [`ClientEngine`]. The server keeps
//! one session per remote transport address, hands out virtual addresses
//! and pushes routes; the client logs in, sends keepalives and reconnects
//! when the server goes quiet.
//!
//! # Features
//!
//! - AES-256-CBC datagram encryption with a passphrase fingerprint in
//!   every header
//! - Explicit plaintext mode for debugging
//! - IPv4 and IPv6 tunnel addresses
//! - Route advertisement from server to clients
//! - Optional peer-to-peer relay on the server

pub mod config;
pub mod error;
pub mod crypto;
pub mod packet;
pub mod route;
pub mod peer;
pub mod client;
pub mod server;
pub mod event_loop;
pub mod tun;
pub mod transport;
pub mod netconf;
pub mod status;

pub use client::ClientEngine;
pub use config::TunnelConfig;
pub use error::{Error, Result};
pub use server::ServerEngine;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{ClientEngine, ClientOptions, ClientState};
    pub use crate::config::{Mode, RawConfig, TunnelConfig};
    pub use crate::crypto::Crypto;
    pub use crate::error::{Error, Result};
    pub use crate::event_loop::{Engine, Io, LoopOptions};
    pub use crate::packet::{Codec, Message, TunnelAddresses};
    pub use crate::route::{RouteEntry, RouteTable};
    pub use crate::server::{ServerEngine, ServerOptions};
}
