//! Single-threaded event loop
//!
//! One `poll(2)` over the TUN descriptor and the UDP socket, woken at least
//! once per tick. The loop is the only caller into an [`Engine`], so
//! engines need no locking.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::netconf::{HostOutcome, HostRequest, Worker};
use crate::status::TunnelStatus;
use crate::transport::DatagramSocket;
use crate::tun::PacketDevice;
use crate::Result;

/// Largest datagram or packet read in one call
const RECV_BUFFER: usize = 65536;

/// Reads per descriptor per wakeup, so one busy side cannot starve the other
const READ_BUDGET: usize = 64;

/// Handles the engines use to reach the outside world
pub struct Io<'a> {
    pub device: &'a mut dyn PacketDevice,
    pub socket: &'a dyn DatagramSocket,
}

/// Protocol logic driven by the event loop
pub trait Engine {
    /// A packet read from the kernel interface
    fn on_device_packet(&mut self, io: &mut Io<'_>, packet: &[u8], now: Instant);

    /// A datagram received on the transport socket
    fn on_datagram(&mut self, io: &mut Io<'_>, datagram: &[u8], from: SocketAddr, now: Instant);

    /// Periodic timer: keepalives, reconnects, expiry
    fn on_tick(&mut self, io: &mut Io<'_>, now: Instant);

    /// Best-effort goodbye before the process exits
    fn on_shutdown(&mut self, _io: &mut Io<'_>) {}

    /// Host configuration work queued since the last call
    fn take_host_requests(&mut self) -> Vec<HostRequest> {
        Vec::new()
    }

    fn on_host_outcome(&mut self, _outcome: HostOutcome) {}

    fn status(&self, now: Instant) -> TunnelStatus;
}

/// Event loop settings
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub tick: Duration,
    pub status_file: Option<PathBuf>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            status_file: None,
        }
    }
}

/// Run until `shutdown` is set. The flag is checked once per iteration,
/// after all in-flight work has completed.
pub fn run<E, D>(
    engine: &mut E,
    device: &mut D,
    socket: &UdpSocket,
    worker: Option<&Worker>,
    shutdown: &AtomicBool,
    options: &LoopOptions,
) -> Result<()>
where
    E: Engine,
    D: PacketDevice + AsRawFd,
{
    let device_fd = device.as_raw_fd();
    let socket_fd = socket.as_raw_fd();
    let mut buf = vec![0u8; RECV_BUFFER];
    let mut next_tick = Instant::now();

    info!("Event loop running");
    while !shutdown.load(Ordering::SeqCst) {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        let (device_ready, socket_ready) = wait_readable(device_fd, socket_fd, timeout)?;

        let mut io = Io {
            device: &mut *device,
            socket,
        };

        if socket_ready {
            for _ in 0..READ_BUDGET {
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => engine.on_datagram(&mut io, &buf[..n], from, Instant::now()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // ICMP errors from earlier sends surface here; not fatal
                        debug!("UDP receive error: {}", e);
                        break;
                    }
                }
            }
        }

        if device_ready {
            for _ in 0..READ_BUDGET {
                match io.device.read_packet(&mut buf) {
                    Ok(Some(0)) => continue,
                    Ok(Some(n)) => engine.on_device_packet(&mut io, &buf[..n], Instant::now()),
                    Ok(None) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("TUN read error: {}", e);
                        break;
                    }
                }
            }
        }

        if let Some(worker) = worker {
            for outcome in worker.drain() {
                engine.on_host_outcome(outcome);
            }
        }

        let now = Instant::now();
        if now >= next_tick {
            engine.on_tick(&mut io, now);
            next_tick = now + options.tick;
            if let Some(path) = &options.status_file {
                if let Err(e) = engine.status(now).write_to(path) {
                    debug!("Status write to {} failed: {}", path.display(), e);
                }
            }
        }

        if let Some(worker) = worker {
            for request in engine.take_host_requests() {
                worker.submit(request);
            }
        }
    }

    info!("Shutting down event loop");
    let mut io = Io {
        device: &mut *device,
        socket,
    };
    engine.on_shutdown(&mut io);
    if let Some(path) = &options.status_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Wait until either descriptor is readable or `timeout` passes.
/// A signal interrupting the wait counts as a timeout.
fn wait_readable(device_fd: RawFd, socket_fd: RawFd, timeout: Duration) -> Result<(bool, bool)> {
    let mut fds = [
        libc::pollfd {
            fd: device_fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: socket_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok((false, false));
        }
        return Err(err.into());
    }
    let ready = |pfd: &libc::pollfd| pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0;
    Ok((ready(&fds[0]), ready(&fds[1])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Counters;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;

    struct PairDevice {
        inner: UnixDatagram,
        written: Vec<Vec<u8>>,
    }

    impl PacketDevice for PairDevice {
        fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            match self.inner.recv(buf) {
                Ok(n) => Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            }
        }

        fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
            self.written.push(packet.to_vec());
            Ok(())
        }
    }

    impl AsRawFd for PairDevice {
        fn as_raw_fd(&self) -> RawFd {
            self.inner.as_raw_fd()
        }
    }

    /// Echoes datagrams into the device and stops once it saw everything
    struct Recorder {
        shutdown: Arc<AtomicBool>,
        packets: Vec<Vec<u8>>,
        datagrams: Vec<(Vec<u8>, SocketAddr)>,
        ticks: usize,
        said_goodbye: bool,
    }

    impl Recorder {
        fn check_done(&self) {
            if !self.packets.is_empty() && !self.datagrams.is_empty() && self.ticks >= 2 {
                self.shutdown.store(true, Ordering::SeqCst);
            }
        }
    }

    impl Engine for Recorder {
        fn on_device_packet(&mut self, _io: &mut Io<'_>, packet: &[u8], _now: Instant) {
            self.packets.push(packet.to_vec());
            self.check_done();
        }

        fn on_datagram(&mut self, io: &mut Io<'_>, datagram: &[u8], from: SocketAddr, _now: Instant) {
            io.device.write_packet(datagram).unwrap();
            self.datagrams.push((datagram.to_vec(), from));
            self.check_done();
        }

        fn on_tick(&mut self, _io: &mut Io<'_>, _now: Instant) {
            self.ticks += 1;
            self.check_done();
        }

        fn on_shutdown(&mut self, _io: &mut Io<'_>) {
            self.said_goodbye = true;
        }

        fn status(&self, _now: Instant) -> TunnelStatus {
            TunnelStatus {
                mode: "test".into(),
                interface: "pair".into(),
                state: None,
                server: None,
                encrypted: false,
                uptime_secs: 0,
                sessions: Vec::new(),
                routes: Vec::new(),
                counters: Counters::default(),
            }
        }
    }

    #[test]
    fn test_loop_dispatches_both_sides() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut device = PairDevice {
            inner: ours,
            written: Vec::new(),
        };

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        theirs.send(b"packet from kernel").unwrap();
        sender.send_to(b"datagram", socket.local_addr().unwrap()).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut engine = Recorder {
            shutdown: shutdown.clone(),
            packets: Vec::new(),
            datagrams: Vec::new(),
            ticks: 0,
            said_goodbye: false,
        };

        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        let options = LoopOptions {
            tick: Duration::from_millis(10),
            status_file: Some(status_path.clone()),
        };
        run(&mut engine, &mut device, &socket, None, &shutdown, &options).unwrap();

        assert_eq!(engine.packets, vec![b"packet from kernel".to_vec()]);
        assert_eq!(engine.datagrams.len(), 1);
        assert_eq!(engine.datagrams[0].1, sender.local_addr().unwrap());
        assert_eq!(device.written, vec![b"datagram".to_vec()]);
        assert!(engine.ticks >= 2);
        assert!(engine.said_goodbye);
        assert!(!status_path.exists());
    }

    #[test]
    fn test_loop_exits_when_flag_already_set() {
        let (ours, _theirs) = UnixDatagram::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut device = PairDevice {
            inner: ours,
            written: Vec::new(),
        };
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut engine = Recorder {
            shutdown: shutdown.clone(),
            packets: Vec::new(),
            datagrams: Vec::new(),
            ticks: 0,
            said_goodbye: false,
        };
        run(&mut engine, &mut device, &socket, None, &shutdown, &LoopOptions::default()).unwrap();
        assert_eq!(engine.ticks, 0);
        assert!(engine.said_goodbye);
    }
}
