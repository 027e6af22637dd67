//! End-to-end tests: a real server engine and client engine talking over
//! an in-memory network, with in-memory TUN devices on both ends.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use vtunnel::client::{ClientEngine, ClientOptions, ClientState};
use vtunnel::crypto::Crypto;
use vtunnel::event_loop::{Engine, Io};
use vtunnel::netconf::HostRequest;
use vtunnel::packet::{Codec, TunnelAddresses};
use vtunnel::route::{RouteEntry, RouteTable};
use vtunnel::server::{ServerEngine, ServerOptions};
use vtunnel::transport::DatagramSocket;
use vtunnel::tun::PacketDevice;

type Wire = Rc<RefCell<VecDeque<(Vec<u8>, SocketAddr, SocketAddr)>>>;

struct WireSocket {
    local: SocketAddr,
    wire: Wire,
}

impl DatagramSocket for WireSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.wire.borrow_mut().push_back((buf.to_vec(), self.local, addr));
        Ok(buf.len())
    }

    fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Err(io::ErrorKind::WouldBlock.into())
    }
}

#[derive(Default)]
struct MemoryDevice {
    written: Vec<Vec<u8>>,
}

impl PacketDevice for MemoryDevice {
    fn read_packet(&mut self, _buf: &mut [u8]) -> io::Result<Option<usize>> {
        Ok(None)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.written.push(packet.to_vec());
        Ok(())
    }
}

const SERVER_ADDR: ([u8; 4], u16) = ([192, 0, 2, 1], 1414);
const CLIENT_ADDR: ([u8; 4], u16) = ([198, 51, 100, 20], 40000);

struct Network {
    wire: Wire,
    start: Instant,
    server: ServerEngine,
    server_socket: WireSocket,
    server_device: MemoryDevice,
    client: ClientEngine,
    client_socket: WireSocket,
    client_device: MemoryDevice,
}

impl Network {
    fn new(server_key: &str, client_key: &str) -> Self {
        let wire: Wire = Rc::new(RefCell::new(VecDeque::new()));
        let start = Instant::now();

        let mut routes = RouteTable::new();
        routes.insert("192.168.1.0/24=10.7.0.1".parse().unwrap());
        let server = ServerEngine::new(
            Codec::new(Crypto::from_passphrase(Some(server_key)), 1416),
            routes,
            ServerOptions {
                own: TunnelAddresses {
                    ipv4: Some(Ipv4Addr::new(10, 7, 0, 1)),
                    ipv6: None,
                },
                pool: Some("10.7.0.0/24".parse().unwrap()),
                session_expiry: Duration::from_secs(39),
                relay: false,
                implicit_login: true,
                route_advertise: true,
                interface: "vt0".into(),
            },
            start,
        );

        let client = ClientEngine::new(
            Codec::new(Crypto::from_passphrase(Some(client_key)), 1416),
            RouteTable::new(),
            ClientOptions {
                server: SocketAddr::from(SERVER_ADDR),
                server_host: "192.0.2.1:1414".into(),
                requested: TunnelAddresses::default(),
                keepalive: Duration::from_secs(13),
                reconnect_timeout: Duration::from_secs(60),
                interface: "vt0".into(),
            },
            start,
        );

        Self {
            server_socket: WireSocket {
                local: SocketAddr::from(SERVER_ADDR),
                wire: wire.clone(),
            },
            client_socket: WireSocket {
                local: SocketAddr::from(CLIENT_ADDR),
                wire: wire.clone(),
            },
            wire,
            start,
            server,
            server_device: MemoryDevice::default(),
            client,
            client_device: MemoryDevice::default(),
        }
    }

    fn at(&self, secs: u64) -> Instant {
        self.start + Duration::from_secs(secs)
    }

    /// Deliver every queued datagram, including replies, until quiet
    fn pump(&mut self, secs: u64) -> usize {
        let now = self.at(secs);
        let mut delivered = 0;
        loop {
            let next = self.wire.borrow_mut().pop_front();
            let Some((datagram, from, to)) = next else {
                break;
            };
            delivered += 1;
            if to == self.server_socket.local {
                let mut io = Io {
                    device: &mut self.server_device,
                    socket: &self.server_socket,
                };
                self.server.on_datagram(&mut io, &datagram, from, now);
            } else if to == self.client_socket.local {
                let mut io = Io {
                    device: &mut self.client_device,
                    socket: &self.client_socket,
                };
                self.client.on_datagram(&mut io, &datagram, from, now);
            }
        }
        delivered
    }

    fn tick_client(&mut self, secs: u64) {
        let now = self.at(secs);
        let mut io = Io {
            device: &mut self.client_device,
            socket: &self.client_socket,
        };
        self.client.on_tick(&mut io, now);
    }

    fn tick_server(&mut self, secs: u64) {
        let now = self.at(secs);
        let mut io = Io {
            device: &mut self.server_device,
            socket: &self.server_socket,
        };
        self.server.on_tick(&mut io, now);
    }

    fn client_sends_packet(&mut self, packet: &[u8], secs: u64) {
        let now = self.at(secs);
        let mut io = Io {
            device: &mut self.client_device,
            socket: &self.client_socket,
        };
        self.client.on_device_packet(&mut io, packet, now);
    }
}

fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    let total = (20 + payload.len()) as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt.extend_from_slice(payload);
    pkt
}

#[test]
fn test_login_route_push_and_data() {
    let mut net = Network::new("secret", "secret");

    net.tick_client(0);
    assert_eq!(net.client.state(), ClientState::LoginSent);
    net.pump(0);

    assert_eq!(net.server.sessions().len(), 1);
    let session = net.server.sessions().get(&SocketAddr::from(CLIENT_ADDR)).unwrap();
    assert_eq!(session.addresses.ipv4, Some(Ipv4Addr::new(10, 7, 0, 2)));

    assert_eq!(net.client.state(), ClientState::Established);
    assert_eq!(net.client.assigned().unwrap().ipv4, Some(Ipv4Addr::new(10, 7, 0, 2)));
    let route: RouteEntry = "192.168.1.0/24=10.7.0.1".parse().unwrap();
    assert_eq!(net.client.routes().all(), &[route]);
    assert_eq!(net.client.take_host_requests(), vec![HostRequest::InstallRoute(route)]);

    let packet = ipv4_packet([10, 7, 0, 2], [192, 168, 1, 5], b"hello lan");
    net.client_sends_packet(&packet, 1);
    net.pump(1);
    assert_eq!(net.server_device.written, vec![packet]);

    // And the reply finds its way back through the session table
    let reply = ipv4_packet([192, 168, 1, 5], [10, 7, 0, 2], b"hello client");
    let mut io = Io {
        device: &mut net.server_device,
        socket: &net.server_socket,
    };
    net.server.on_device_packet(&mut io, &reply, net.start);
    net.pump(1);
    assert_eq!(net.client_device.written, vec![reply]);
}

#[test]
fn test_mismatched_passphrase_never_reaches_device() {
    let mut net = Network::new("secret", "not-the-secret");

    for secs in [0, 13, 26] {
        net.tick_client(secs);
        let packet = ipv4_packet([10, 7, 0, 2], [192, 168, 1, 5], b"should not pass");
        net.client_sends_packet(&packet, secs);
        net.pump(secs);
    }

    assert!(net.server.sessions().is_empty());
    assert!(net.server_device.written.is_empty());
    assert_eq!(net.server.counters().datagrams_in, 0);
    assert_eq!(net.server.counters().dropped_auth, 6);
    assert_eq!(net.client.state(), ClientState::LoginSent);
}

#[test]
fn test_client_reconnects_after_silence() {
    let mut net = Network::new("secret", "secret");
    net.tick_client(0);
    net.pump(0);
    assert_eq!(net.client.state(), ClientState::Established);
    net.client.take_host_requests();

    // The server vanishes: keepalives go unanswered
    for secs in 1..=61 {
        net.tick_client(secs);
        net.wire.borrow_mut().clear();
    }
    assert_eq!(net.client.state(), ClientState::Disconnected);
    assert!(matches!(
        net.client.take_host_requests().as_slice(),
        [HostRequest::Resolve { .. }]
    ));

    // Next tick logs in again and the server confirms the same address
    net.tick_client(62);
    assert_eq!(net.client.state(), ClientState::LoginSent);
    net.pump(62);
    assert_eq!(net.client.state(), ClientState::Established);
    assert_eq!(net.client.assigned().unwrap().ipv4, Some(Ipv4Addr::new(10, 7, 0, 2)));
}

#[test]
fn test_server_expires_silent_client() {
    let mut net = Network::new("secret", "secret");
    net.tick_client(0);
    net.pump(0);
    assert_eq!(net.server.sessions().len(), 1);

    net.tick_server(30);
    assert_eq!(net.server.sessions().len(), 1);
    net.tick_server(40);
    assert!(net.server.sessions().is_empty());

    // A keepalive from the forgotten client is answered with DISCONNECT,
    // which sends it back through a fresh login
    net.tick_client(41);
    net.pump(41);
    assert_eq!(net.client.state(), ClientState::Disconnected);
    net.tick_client(42);
    net.pump(42);
    assert_eq!(net.client.state(), ClientState::Established);
    let session = net.server.sessions().get(&SocketAddr::from(CLIENT_ADDR)).unwrap();
    assert_eq!(session.created, net.at(42));
}
