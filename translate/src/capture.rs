//! Packet capture and raw-IP injection.
//!
//! Capture uses an `AF_PACKET` datagram socket bound to the input interface:
//! the kernel strips the link-layer header, so every read starts at the IP
//! header. A userspace prefilter stands in for the classic
//! `udp and src <s> and dst <g>` capture filter. Injection goes through a
//! raw `IPPROTO_RAW` socket bound to the output interface and connected to
//! the output group; the kernel takes care of layer-2 framing.

use anyhow::{Context as _, Result, bail};
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd};
use std::time::Duration;

/// Wakeup granularity of the capture loop: how often it can notice a stop
/// request or an expired inactivity timer while no traffic arrives.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Capture {
    fd: OwnedFd,
}

impl Capture {
    pub fn open(interface: &str, ipv6: bool) -> Result<Self> {
        let protocol = if ipv6 {
            libc::ETH_P_IPV6
        } else {
            libc::ETH_P_IP
        };
        let protocol_be = (protocol as u16).to_be();

        // SAFETY: plain socket(2) call; the fd is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM,
                i32::from(protocol_be),
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error()).context("Failed to open AF_PACKET socket");
        }
        // SAFETY: `raw` is a freshly created, valid fd that we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let name = CString::new(interface).context("Interface name contains a NUL byte")?;
        // SAFETY: `name` is a valid NUL-terminated string.
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            bail!("Interface `{interface}` not found");
        }

        // SAFETY: sockaddr_ll is zero-initialisable; we fill the fields that
        // matter for a bind.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol_be;
        addr.sll_ifindex = ifindex as i32;

        // SAFETY: `addr` is a properly initialised sockaddr_ll.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to bind capture socket to `{interface}`"));
        }

        let timeout = libc::timeval {
            tv_sec: RECV_TIMEOUT.as_secs() as libc::time_t,
            tv_usec: 0,
        };
        // SAFETY: `timeout` is a valid timeval.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                std::ptr::addr_of!(timeout).cast(),
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("Failed to set receive timeout");
        }

        Ok(Self { fd })
    }

    /// Blocks for at most [`RECV_TIMEOUT`]; `Ok(None)` means the timer (or a
    /// signal) woke us without a packet.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        // SAFETY: `buf` is a valid writable slice for its whole length.
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };

        if len < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(err),
            };
        }

        Ok(Some(len as usize))
    }
}

pub struct Inject {
    socket: socket2::Socket,
}

impl Inject {
    pub fn open(interface: &str, group: IpAddr) -> Result<Self> {
        let domain = match group {
            IpAddr::V4(_) => socket2::Domain::IPV4,
            IpAddr::V6(_) => socket2::Domain::IPV6,
        };

        let socket = socket2::Socket::new(
            domain,
            socket2::Type::RAW,
            Some(socket2::Protocol::from(libc::IPPROTO_RAW)),
        )
        .context("Failed to open raw socket")?;

        socket
            .bind_device(Some(interface.as_bytes()))
            .with_context(|| format!("Failed to bind raw socket to `{interface}`"))?;
        socket
            .connect(&SocketAddr::new(group, 0).into())
            .with_context(|| format!("Failed to connect raw socket to {group}"))?;

        Ok(Self { socket })
    }

    pub fn send(&self, pkt: &[u8]) -> io::Result<usize> {
        self.socket.send(pkt)
    }
}

/// Userspace stand-in for the `udp and src <s> and dst <g>` capture filter.
pub struct InputFilter {
    src: IpAddr,
    grp: IpAddr,
}

impl InputFilter {
    pub fn new(src: IpAddr, grp: IpAddr) -> Self {
        Self { src, grp }
    }

    pub fn matches(&self, pkt: &[u8]) -> bool {
        match (self.src, self.grp) {
            (IpAddr::V4(src), IpAddr::V4(grp)) => {
                pkt.len() >= 20
                    && pkt[0] >> 4 == 4
                    && pkt[9] == 17
                    && pkt[12..16] == src.octets()
                    && pkt[16..20] == grp.octets()
            }
            (IpAddr::V6(src), IpAddr::V6(grp)) => {
                // Next-header checking is left to the translator, which
                // knows how to walk extension chains.
                pkt.len() >= 40
                    && pkt[0] >> 4 == 6
                    && pkt[8..24] == src.octets()
                    && pkt[24..40] == grp.octets()
            }
            (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_packet(src: [u8; 4], dst: [u8; 4], proto: u8) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[9] = proto;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);

        pkt
    }

    #[test]
    fn filter_matches_configured_flow_only() {
        let filter = InputFilter::new("10.1.1.1".parse().unwrap(), "232.1.1.1".parse().unwrap());

        assert!(filter.matches(&v4_packet([10, 1, 1, 1], [232, 1, 1, 1], 17)));
        assert!(!filter.matches(&v4_packet([10, 1, 1, 2], [232, 1, 1, 1], 17)));
        assert!(!filter.matches(&v4_packet([10, 1, 1, 1], [232, 1, 1, 2], 17)));
        assert!(!filter.matches(&v4_packet([10, 1, 1, 1], [232, 1, 1, 1], 6)));
        assert!(!filter.matches(&[0u8; 8]));
    }
}
