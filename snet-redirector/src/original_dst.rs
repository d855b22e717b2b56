//! The `get_original_destination` collaborator (spec §6): recovering the
//! 4-tuple the OS redirected away from an accepted socket. This is
//! platform-specific and treated as an external mechanism by spec.md §1 —
//! what's specified here is the narrow trait boundary the redirector
//! calls through, plus the two real implementations a complete workspace
//! needs in order to compile and run on either platform.

use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Recovers the original destination of a socket the OS has transparently
/// redirected to our listener.
pub trait OriginalDst {
    fn original_dst(&self) -> io::Result<SocketAddr>;
}

#[cfg(target_os = "linux")]
impl OriginalDst for TcpStream {
    fn original_dst(&self) -> io::Result<SocketAddr> {
        linux::original_dst(self)
    }
}

#[cfg(target_os = "macos")]
impl OriginalDst for TcpStream {
    fn original_dst(&self) -> io::Result<SocketAddr> {
        macos::original_dst(self)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
impl OriginalDst for TcpStream {
    fn original_dst(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transparent redirection is only implemented on linux and macos",
        ))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;
    use tokio::net::TcpStream;

    /// Reads `SO_ORIGINAL_DST` (`IPPROTO_IP`, option `80`) from an accepted
    /// socket the kernel's netfilter `REDIRECT`/`TPROXY` target rewrote.
    pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
        const SO_ORIGINAL_DST: libc::c_int = 80;

        let fd = stream.as_raw_fd();
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);

        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use tokio::net::TcpStream;

    const PF_DEVICE: &str = "/dev/pf";

    #[repr(C)]
    struct PfAddr {
        addr: [u8; 16],
    }

    #[repr(C)]
    struct PfdNatlook {
        saddr: PfAddr,
        daddr: PfAddr,
        rsaddr: PfAddr,
        rdaddr: PfAddr,
        sport: u16,
        dport: u16,
        rsport: u16,
        rdport: u16,
        af: u8,
        proto: u8,
        direction: u8,
        pad: [u8; 1],
    }

    const DIOCNATLOOK: libc::c_ulong = 0xc0544417;

    /// Queries the packet filter NAT lookup table (`DIOCNATLOOK`), keyed
    /// by the accepted socket's (client_addr, local_addr) pair, for the
    /// original destination before `pfctl`'s redirect rule rewrote it.
    pub fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;

        let (peer_v4, local_v4) = match (peer, local) {
            (SocketAddr::V4(p), SocketAddr::V4(l)) => (p, l),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "DIOCNATLOOK is only implemented for IPv4 in this build",
                ))
            }
        };

        let pf_fd = unsafe { libc::open(format!("{PF_DEVICE}\0").as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        if pf_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut lookup: PfdNatlook = unsafe { mem::zeroed() };
        lookup.af = libc::AF_INET as u8;
        lookup.proto = libc::IPPROTO_TCP as u8;
        lookup.direction = 0; // PF_OUT: lookup from the perspective of the originating process
        lookup.saddr.addr[..4].copy_from_slice(&peer_v4.ip().octets());
        lookup.daddr.addr[..4].copy_from_slice(&local_v4.ip().octets());
        lookup.sport = peer_v4.port().to_be();
        lookup.dport = local_v4.port().to_be();

        let ret = unsafe { libc::ioctl(pf_fd, DIOCNATLOOK, &mut lookup as *mut _ as *mut libc::c_void) };
        let saved_errno = io::Error::last_os_error();
        unsafe {
            libc::close(pf_fd);
        }

        if ret != 0 {
            return Err(saved_errno);
        }

        let ip = Ipv4Addr::new(
            lookup.rdaddr.addr[0],
            lookup.rdaddr.addr[1],
            lookup.rdaddr.addr[2],
            lookup.rdaddr.addr[3],
        );
        let port = u16::from_be(lookup.rdport);

        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
}
