//! Host network configuration for vtunnel
//!
//! Everything that touches the host's interface and routing setup lives
//! behind [`InterfaceConfigurator`]. MTU and link state are set with
//! native ioctls; addresses and routes go through the `ip` tool. Calls
//! made while the tunnel is running are queued on a background [`Worker`]
//! so they never stall datagram processing.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Command;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::route::RouteEntry;
use crate::transport;
use crate::{Error, Result};

/// An address to put on the tunnel interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAddress {
    /// `local/prefix`
    Ipv4 { local: Ipv4Addr, prefix: u8 },
    /// `local` with a point-to-point `peer`
    Ipv4PointToPoint { local: Ipv4Addr, peer: Ipv4Addr },
    /// `local/prefix`
    Ipv6 { local: Ipv6Addr, prefix: u8 },
}

/// Narrow interface to the host's network configuration
pub trait InterfaceConfigurator: Send {
    fn set_address(&self, ifname: &str, address: &InterfaceAddress) -> Result<()>;

    fn set_mtu_and_up(&self, ifname: &str, mtu: u16) -> Result<()>;

    fn add_route(&self, route: &RouteEntry, ifname: &str) -> Result<()>;

    /// Assign addresses, set the MTU and bring the interface up
    fn configure_interface(&self, ifname: &str, addresses: &[InterfaceAddress], mtu: u16) -> Result<()> {
        for address in addresses {
            self.set_address(ifname, address)?;
        }
        self.set_mtu_and_up(ifname, mtu)
    }
}

/// Linux implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxNetConfig;

#[repr(C)]
struct IfreqInt {
    ifr_name: [u8; 16],
    value: libc::c_int,
    _pad: [u8; 20],
}

#[repr(C)]
struct IfreqFlags {
    ifr_name: [u8; 16],
    flags: libc::c_short,
    _pad: [u8; 22],
}

fn ifname_bytes(ifname: &str) -> Result<[u8; 16]> {
    if ifname.is_empty() || ifname.len() > 15 {
        return Err(Error::Device(format!("invalid interface name '{}'", ifname)));
    }
    let mut name = [0u8; 16];
    name[..ifname.len()].copy_from_slice(ifname.as_bytes());
    Ok(name)
}

/// Closes the control socket on every exit path
struct ControlSocket(libc::c_int);

impl ControlSocket {
    fn open() -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(Error::Device(format!(
                "control socket: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(Self(fd))
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T, what: &str) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.0, request as _, arg as *mut T) };
        if ret < 0 {
            return Err(Error::Device(format!("{}: {}", what, io::Error::last_os_error())));
        }
        Ok(())
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn run_ip(args: &[String]) -> Result<()> {
    debug!("ip {}", args.join(" "));
    let status = Command::new("ip")
        .args(args)
        .status()
        .map_err(|e| Error::Device(format!("failed to run ip: {}", e)))?;
    if !status.success() {
        return Err(Error::Device(format!("'ip {}' exited with {}", args.join(" "), status)));
    }
    Ok(())
}

impl InterfaceConfigurator for LinuxNetConfig {
    fn set_address(&self, ifname: &str, address: &InterfaceAddress) -> Result<()> {
        ifname_bytes(ifname)?;
        let args: Vec<String> = match *address {
            InterfaceAddress::Ipv4 { local, prefix } => {
                vec!["addr".into(), "add".into(), format!("{}/{}", local, prefix), "dev".into(), ifname.into()]
            }
            InterfaceAddress::Ipv4PointToPoint { local, peer } => vec![
                "addr".into(),
                "add".into(),
                local.to_string(),
                "peer".into(),
                peer.to_string(),
                "dev".into(),
                ifname.into(),
            ],
            InterfaceAddress::Ipv6 { local, prefix } => vec![
                "-6".into(),
                "addr".into(),
                "add".into(),
                format!("{}/{}", local, prefix),
                "dev".into(),
                ifname.into(),
            ],
        };
        run_ip(&args)
    }

    fn set_mtu_and_up(&self, ifname: &str, mtu: u16) -> Result<()> {
        let name = ifname_bytes(ifname)?;
        let sock = ControlSocket::open()?;

        let mut mtu_req = IfreqInt {
            ifr_name: name,
            value: mtu as libc::c_int,
            _pad: [0u8; 20],
        };
        sock.ioctl(libc::SIOCSIFMTU as libc::c_ulong, &mut mtu_req, "SIOCSIFMTU")?;

        let mut flags_req = IfreqFlags {
            ifr_name: name,
            flags: 0,
            _pad: [0u8; 22],
        };
        sock.ioctl(libc::SIOCGIFFLAGS as libc::c_ulong, &mut flags_req, "SIOCGIFFLAGS")?;
        flags_req.flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        sock.ioctl(libc::SIOCSIFFLAGS as libc::c_ulong, &mut flags_req, "SIOCSIFFLAGS")?;

        info!("Interface {} up, mtu {}", ifname, mtu);
        Ok(())
    }

    fn add_route(&self, route: &RouteEntry, ifname: &str) -> Result<()> {
        ifname_bytes(ifname)?;
        let mut args: Vec<String> = Vec::with_capacity(8);
        if !route.is_ipv4() {
            args.push("-6".into());
        }
        args.push("route".to_string());
        args.push("replace".to_string());
        args.push(route.network.to_string());
        args.push("via".to_string());
        args.push(route.gateway.to_string());
        args.push("dev".to_string());
        args.push(ifname.to_string());
        run_ip(&args)
    }
}

/// Work for the background thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    InstallRoute(RouteEntry),
    /// Re-resolve `host` keeping the family of `current`
    Resolve { host: String, current: SocketAddr },
}

/// Result reported back to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    RouteInstalled(RouteEntry),
    Resolved(SocketAddr),
    Failed(String),
}

/// Background thread running host configuration jobs in order
pub struct Worker {
    jobs: Option<Sender<HostRequest>>,
    outcomes: Receiver<HostOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(configurator: Box<dyn InterfaceConfigurator>, ifname: String) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<HostRequest>();
        let (out_tx, out_rx) = mpsc::channel::<HostOutcome>();

        let handle = std::thread::Builder::new()
            .name("vtunnel-host".into())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let outcome = run_job(configurator.as_ref(), &ifname, job);
                    if out_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            jobs: Some(job_tx),
            outcomes: out_rx,
            handle: Some(handle),
        })
    }

    pub fn submit(&self, request: HostRequest) {
        if let Some(jobs) = &self.jobs {
            if jobs.send(request).is_err() {
                warn!("Host configuration worker is gone");
            }
        }
    }

    /// Collect every outcome reported so far without blocking
    pub fn drain(&self) -> Vec<HostOutcome> {
        let mut out = Vec::new();
        loop {
            match self.outcomes.try_recv() {
                Ok(outcome) => out.push(outcome),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_job(configurator: &dyn InterfaceConfigurator, ifname: &str, job: HostRequest) -> HostOutcome {
    match job {
        HostRequest::InstallRoute(route) => match configurator.add_route(&route, ifname) {
            Ok(()) => HostOutcome::RouteInstalled(route),
            Err(e) => HostOutcome::Failed(format!("route {}: {}", route, e)),
        },
        HostRequest::Resolve { host, current } => match transport::resolve(&host, Some(&current)) {
            Ok(addr) => HostOutcome::Resolved(addr),
            Err(e) => HostOutcome::Failed(e.to_string()),
        },
    }
}
