//! UDP socket construction with the IP-level options TWAMP sessions need.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::IpVersion;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub ttl: u32,
    pub tos: u32,
    pub do_not_fragment: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self { ttl: 64, tos: 0, do_not_fragment: false }
    }
}

/// Wildcard bind address for a family.
pub fn any_addr(version: IpVersion, port: u16) -> SocketAddr {
    match version {
        IpVersion::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpVersion::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// Create a bound, nonblocking UDP socket with session options applied and
/// hand it to tokio.
pub fn udp_socket(version: IpVersion, bind: SocketAddr, opts: SocketOptions) -> Result<UdpSocket> {
    let domain = match version {
        IpVersion::V4 => Domain::IPV4,
        IpVersion::V6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // TTL/ToS and their v6 counterparts are best effort, like the original
    // tool: a refusing kernel should not kill the session.
    match version {
        IpVersion::V4 => {
            if let Err(err) = socket.set_ttl(opts.ttl) {
                warn!(%err, "could not set IP TTL");
            }
            if let Err(err) = socket.set_tos(opts.tos) {
                warn!(%err, "could not set IP ToS");
            }
            if opts.do_not_fragment {
                set_dont_fragment_v4(&socket);
            }
        }
        IpVersion::V6 => {
            if let Err(err) = socket.set_unicast_hops_v6(opts.ttl) {
                warn!(%err, "could not set IPv6 hop limit");
            }
            if let Err(err) = socket.set_tclass_v6(opts.tos) {
                warn!(%err, "could not set IPv6 traffic class");
            }
            if opts.do_not_fragment {
                warn!("Don't Fragment is an IPv4 flag and is ignored for IPv6");
            }
        }
    }

    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Set `IP_MTU_DISCOVER = IP_PMTUDISC_DO`, the Linux spelling of the IPv4
/// Don't-Fragment bit. No socket2 wrapper exists for this option.
#[cfg(target_os = "linux")]
fn set_dont_fragment_v4(socket: &Socket) {
    let value: libc::c_int = libc::IP_PMTUDISC_DO;
    // Safety: the fd is valid for the lifetime of `socket` and the option
    // payload is a plain c_int.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!(
            err = %std::io::Error::last_os_error(),
            "could not set IP_MTU_DISCOVER (Don't Fragment)"
        );
    } else {
        debug!("IPv4 Don't Fragment enabled (IP_PMTUDISC_DO)");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment_v4(_socket: &Socket) {
    warn!("Don't Fragment via socket options is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_binds_and_reports_addr() {
        let sock = udp_socket(
            IpVersion::V4,
            any_addr(IpVersion::V4, 0),
            SocketOptions::default(),
        )
        .unwrap();
        let addr = sock.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_socket_with_options() {
        let opts = SocketOptions { ttl: 32, tos: 0xb8, do_not_fragment: true };
        let sock = udp_socket(IpVersion::V4, any_addr(IpVersion::V4, 0), opts).unwrap();
        assert!(sock.local_addr().is_ok());
    }
}
