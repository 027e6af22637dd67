//! TUN device management for vtunnel
//!
//! Creates a virtual network interface using the Linux TUN driver and
//! exposes it to the engines as "read one packet" / "write one packet".

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::debug;

use crate::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int)
// PowerPC encodes ioctl direction bits differently from x86/ARM.
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Kernel interface names are at most 15 bytes plus NUL
pub const MAX_IFNAME_LEN: usize = 15;

/// Source and sink of raw IP packets
pub trait PacketDevice {
    /// Read one packet into `buf`. `Ok(None)` when nothing is queued.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Write one packet to the kernel
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// A Linux TUN device
pub struct TunDevice {
    fd: RawFd,
    name: String,
}

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl TunDevice {
    /// Create a TUN device. `name` may contain a `%d` template.
    pub fn create(name: &str) -> Result<Self> {
        if name.len() > MAX_IFNAME_LEN || name.contains('\0') {
            return Err(Error::Device(format!("invalid interface name '{}'", name)));
        }

        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::Device(format!(
                "failed to open /dev/net/tun: {}",
                io::Error::last_os_error()
            )));
        }

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Device(format!("ioctl TUNSETIFF failed: {}", err)));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Device(format!("failed to set O_NONBLOCK: {}", err)));
        }

        let end = req.ifr_name.iter().position(|&b| b == 0).unwrap_or(req.ifr_name.len());
        let actual_name = String::from_utf8_lossy(&req.ifr_name[..end]).into_owned();
        debug!("Allocated TUN device {}", actual_name);

        Ok(Self { fd, name: actual_name })
    }

    /// Get the interface name chosen by the kernel
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PacketDevice for TunDevice {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(n as usize))
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        let n = unsafe { libc::write(self.fd, packet.as_ptr() as *const _, packet.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Extract the destination address from a raw IPv4 or IPv6 packet
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= 40 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(b)))
        }
        _ => None,
    }
}

/// Extract the source address from a raw IPv4 or IPv6 packet
pub fn source(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            packet[12], packet[13], packet[14], packet[15],
        ))),
        6 if packet.len() >= 40 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&packet[8..24]);
            Some(IpAddr::V6(Ipv6Addr::from(b)))
        }
        _ => None,
    }
}
