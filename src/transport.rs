//! Network transport layer for vtunnel
//!
//! Thin wrapper over a non-blocking UDP socket plus helpers to send
//! encoded tunnel messages and to resolve the server address.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::debug;

use crate::packet::{Codec, Message};
use crate::{Error, Result};

/// Connectionless datagram socket used by the engines
pub trait DatagramSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram. Returns `WouldBlock` when nothing is queued.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }
}

/// Encode `message` and send it to `to`
pub fn send_message(
    socket: &dyn DatagramSocket,
    codec: &Codec,
    message: &Message,
    to: SocketAddr,
) -> Result<usize> {
    let datagram = codec.encode(message)?;
    let sent = socket.send_to(&datagram, to).map_err(Error::Transport)?;
    debug!("Sent {:?} ({} bytes) to {}", message.msg_type(), sent, to);
    Ok(sent)
}

/// Bind a non-blocking socket for the server side
pub fn bind_listener(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).map_err(|e| {
        Error::Config(format!("failed to bind UDP {}: {}", addr, e))
    })?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a non-blocking ephemeral socket able to reach `server`
pub fn bind_for_server(server: &SocketAddr) -> Result<UdpSocket> {
    let local: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Resolve `host:port`. With `same_family_as`, only addresses of that
/// family are accepted.
pub fn resolve(host_port: &str, same_family_as: Option<&SocketAddr>) -> Result<SocketAddr> {
    let candidates = host_port
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve '{}': {}", host_port, e)))?;
    let mut candidates = candidates.filter(|addr| {
        same_family_as.map_or(true, |want| want.is_ipv4() == addr.is_ipv4())
    });
    candidates
        .next()
        .ok_or_else(|| Error::Config(format!("no usable address for '{}'", host_port)))
}
