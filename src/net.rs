//! UDP socket plumbing for the datagram server and sessions.
//!
//! The listener learns the true local destination of every datagram through
//! `IPV6_PKTINFO` ancillary data. This is needed to create a reply socket
//! bound to the exact address the peer talked to.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

/// A datagram seen with `MSG_PEEK`. It is still queued on the socket.
#[derive(Debug, Clone, Copy)]
pub struct Peeked {
    pub len: usize,
    pub source: SocketAddr,
    /// Local address the datagram was sent to. `None` when the kernel did
    /// not deliver packet info.
    pub destination: Option<SocketAddr>,
}

/// Bind the IPv6-only listening socket with destination packet info enabled.
pub fn bind_listener(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    enable_recv_pktinfo(socket.as_raw_fd())?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    debug!(
        "Listening on {} fd={}",
        socket.local_addr()?,
        socket.as_raw_fd()
    );
    Ok(socket)
}

/// A socket dedicated to one peer: bound to the local address the peer
/// reached, and connected to the peer so the kernel routes its datagrams
/// here instead of to the listener.
pub fn reply_socket(local: SocketAddr, peer: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    if local.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    socket.connect(&peer.into())?;
    Ok(socket.into())
}

/// Non-blocking socket on an ephemeral port, connected to `peer`.
pub fn connected_socket(peer: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local)?;
    socket.connect(peer)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Run `send` until it gets past would-block, waiting for `fd` to turn
/// writable in between. Fails with `TimedOut` once `timeout` has passed.
pub fn send_retrying(
    fd: RawFd,
    timeout: Duration,
    mut send: impl FnMut() -> io::Result<usize>,
) -> io::Result<usize> {
    let deadline = Instant::now() + timeout;
    loop {
        match send() {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "send would block"));
                }
                wait_writable(fd, deadline - now)?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Block until `fd` is writable or `timeout` passes. Returns whether it is
/// writable.
pub fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let millis = timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY:
    // - pfd is a single initialized pollfd on the stack, nfds is 1
    let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
    match ret {
        n if n < 0 => {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(e)
            }
        }
        0 => Ok(false),
        _ => Ok(pfd.revents & libc::POLLOUT != 0),
    }
}

fn enable_recv_pktinfo(fd: RawFd) -> io::Result<()> {
    let val: libc::c_int = 1;
    // SAFETY:
    // - fd is a socket owned by the caller for the duration of the call
    // - val is an initialized c_int on the stack and the length matches it
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Aligned storage for control messages.
#[repr(C, align(8))]
struct CmsgBuf([u8; 128]);

/// Peek the next datagram on an IPv6 socket without consuming it.
///
/// Returns `Ok(None)` when nothing is queued. The destination port is the
/// listener's own port since packet info carries only the address.
pub fn peek_with_destination(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Option<Peeked>> {
    let local_port = socket.local_addr()?.port();

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut name = MaybeUninit::<libc::sockaddr_in6>::zeroed();
    let mut control = CmsgBuf([0; 128]);

    // SAFETY:
    // - msghdr is a POD type that can be safely zero-initialized
    // - every pointer field is set below before recvmsg is called
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = name.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.0.len() as _;

    // SAFETY:
    // - msg points at name, iov and control which all outlive the call
    // - the lengths in msg match the sizes of those buffers
    let ret = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_PEEK) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    // SAFETY: recvmsg succeeded so the kernel wrote msg_namelen bytes of
    // address, and the storage was zeroed before that.
    let name = unsafe { name.assume_init() };
    if name.sin6_family as libc::c_int != libc::AF_INET6 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram from non-IPv6 source",
        ));
    }
    let source = SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(name.sin6_addr.s6_addr),
        u16::from_be(name.sin6_port),
        name.sin6_flowinfo,
        name.sin6_scope_id,
    ));

    let mut destination = None;
    // SAFETY:
    // - recvmsg succeeded, msg_control/msg_controllen describe the control
    //   data the kernel wrote into `control`
    // - CMSG_FIRSTHDR/CMSG_NXTHDR return null or a header inside `control`
    // - the header is only dereferenced after the null check and the payload
    //   is read unaligned
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IPV6 && (*cmsg).cmsg_type == libc::IPV6_PKTINFO
            {
                let info: libc::in6_pktinfo =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                let addr = Ipv6Addr::from(info.ipi6_addr.s6_addr);
                if !addr.is_unspecified() {
                    destination = Some(SocketAddr::V6(SocketAddrV6::new(
                        addr,
                        local_port,
                        0,
                        info.ipi6_ifindex,
                    )));
                }
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Some(Peeked {
        len: ret as usize,
        source,
        destination,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_reports_source_and_destination() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let target: SocketAddr = (Ipv6Addr::LOCALHOST, port).into();

        let client = connected_socket(target).unwrap();
        client.send(b"hello").unwrap();

        let mut buf = [0; 64];
        let peeked = loop {
            if let Some(p) = peek_with_destination(&listener, &mut buf).unwrap() {
                break p;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        assert_eq!(peeked.len, 5);
        assert_eq!(peeked.source, client.local_addr().unwrap());
        assert_eq!(peeked.destination.map(|d| d.ip()), Some(target.ip()));
        assert_eq!(peeked.destination.map(|d| d.port()), Some(port));

        // Still queued.
        let (n, from) = listener.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, peeked.source);
    }

    #[test]
    fn send_retries_past_would_block() {
        let socket = connected_socket((Ipv6Addr::LOCALHOST, 9).into()).unwrap();
        let mut attempts = 0;
        let sent = send_retrying(socket.as_raw_fd(), Duration::from_secs(1), || {
            attempts += 1;
            if attempts < 3 {
                Err(io::ErrorKind::WouldBlock.into())
            } else {
                Ok(5)
            }
        })
        .unwrap();
        assert_eq!(sent, 5);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn send_that_keeps_blocking_times_out() {
        let socket = connected_socket((Ipv6Addr::LOCALHOST, 9).into()).unwrap();
        let err = send_retrying(socket.as_raw_fd(), Duration::from_millis(30), || {
            Err(io::ErrorKind::WouldBlock.into())
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn empty_listener_peeks_nothing() {
        let listener = bind_listener(0).unwrap();
        let mut buf = [0; 16];
        assert!(peek_with_destination(&listener, &mut buf).unwrap().is_none());
    }
}
