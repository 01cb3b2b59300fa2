//! socket address helpers for the send interceptors

use libc::{c_int, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};
use nix::errno::Errno;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// converts a raw IPv4/IPv6 socket address; anything else yields `None`
///
/// # Safety
/// `addr` must be null or point to at least `len` readable bytes
pub unsafe fn sockaddr_to_std(addr: *const sockaddr, len: socklen_t) -> Option<SocketAddr> {
    if addr.is_null() || (len as usize) < mem::size_of::<libc::sa_family_t>() {
        return None;
    }

    // callers may hand us unaligned buffers
    let family = std::ptr::read_unaligned(std::ptr::addr_of!((*addr).sa_family));

    match c_int::from(family) {
        libc::AF_INET if len as usize >= mem::size_of::<sockaddr_in>() => {
            let sin = std::ptr::read_unaligned(addr as *const sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<sockaddr_in6>() => {
            let sin6 = std::ptr::read_unaligned(addr as *const sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// remote address of a connected socket, leaving errno untouched
pub fn peer_address(fd: c_int) -> Option<SocketAddr> {
    let saved = Errno::last_raw();

    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
    let rc = unsafe {
        libc::getpeername(
            fd,
            &mut storage as *mut sockaddr_storage as *mut sockaddr,
            &mut len,
        )
    };

    let peer = if rc == 0 {
        unsafe { sockaddr_to_std(&storage as *const sockaddr_storage as *const sockaddr, len) }
    } else {
        None
    };

    Errno::set_raw(saved);
    peer
}

/// whether `fd` is a connection-mode socket, where the kernel ignores any
/// explicit destination; errno is left untouched
pub fn is_connection_mode(fd: c_int) -> bool {
    let saved = Errno::last_raw();

    let mut kind: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut kind as *mut c_int as *mut libc::c_void,
            &mut len,
        )
    };

    Errno::set_raw(saved);
    rc == 0 && matches!(kind, libc::SOCK_STREAM | libc::SOCK_SEQPACKET)
}

#[cfg(test)]
pub(crate) fn std_to_sockaddr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in, sin) };
            mem::size_of::<sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut sockaddr_in6, sin6) };
            mem::size_of::<sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::os::fd::AsRawFd;

    #[test]
    fn converts_ipv4_and_ipv6() {
        for text in ["127.0.0.1:8080", "[::1]:443", "[2001:db8::7]:22"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (storage, len) = std_to_sockaddr(&addr);
            let back = unsafe { sockaddr_to_std(&storage as *const _ as *const sockaddr, len) };
            assert_eq!(back, Some(addr));
        }
    }

    #[test]
    fn rejects_null_short_and_foreign_addresses() {
        assert_eq!(unsafe { sockaddr_to_std(std::ptr::null(), 16) }, None);

        let (storage, _) = std_to_sockaddr(&"127.0.0.1:1".parse().unwrap());
        let ptr = &storage as *const _ as *const sockaddr;
        assert_eq!(unsafe { sockaddr_to_std(ptr, 4) }, None);

        let mut unix: sockaddr_storage = unsafe { mem::zeroed() };
        unix.ss_family = libc::AF_UNIX as libc::sa_family_t;
        let ptr = &unix as *const _ as *const sockaddr;
        let len = mem::size_of::<sockaddr_storage>() as socklen_t;
        assert_eq!(unsafe { sockaddr_to_std(ptr, len) }, None);
    }

    #[test]
    fn finds_peer_of_connected_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server = listener.local_addr().unwrap();
        let client = TcpStream::connect(server).unwrap();

        assert_eq!(peer_address(client.as_raw_fd()), Some(server));
    }

    #[test]
    fn unconnected_socket_has_no_peer_and_keeps_errno() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        Errno::set_raw(libc::EAGAIN);
        assert_eq!(peer_address(socket.as_raw_fd()), None);
        assert_eq!(Errno::last_raw(), libc::EAGAIN);
    }

    #[test]
    fn streams_are_connection_mode_datagrams_are_not() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let datagram = UdpSocket::bind("127.0.0.1:0").unwrap();
        let file = tempfile::tempfile().unwrap();

        Errno::set_raw(libc::EINTR);
        assert!(is_connection_mode(client.as_raw_fd()));
        assert!(!is_connection_mode(datagram.as_raw_fd()));
        assert!(!is_connection_mode(file.as_raw_fd()));
        assert!(!is_connection_mode(-1));
        assert_eq!(Errno::last_raw(), libc::EINTR);
    }
}
