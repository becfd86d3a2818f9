//! Raw TCP socket plumbing.
//!
//! Sessions own plain socket descriptors rather than `std::net` wrappers:
//! the reader needs non-blocking descriptors it can park in a
//! [`WaitSet`](super::waiter::WaitSet), the connect path needs the
//! non-blocking connect / wait-for-writable / `SO_ERROR` sequence, and the
//! greetings exchange flips the same descriptor back to blocking for its
//! duration. Everything here is a thin layer over `libc`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use super::context::Context;
use super::error::{Error, Result};
use super::waiter::{Wait, WaitDirection, WaitSet};

/// Sentinel for "no socket".
pub const INVALID_SOCKET: RawFd = -1;

/// Network transport used by a session, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// TCP over IPv4.
    #[default]
    Ipv4,
    /// TCP over IPv6.
    Ipv6,
}

fn check(rc: i32) -> io::Result<i32> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc)
}

fn check_len(rc: isize) -> io::Result<usize> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Create a stream socket for the given transport.
pub(crate) fn create(transport: Transport) -> io::Result<RawFd> {
    let family = match transport {
        Transport::Ipv4 => libc::AF_INET,
        Transport::Ipv6 => libc::AF_INET6,
    };
    // SAFETY: socket(2) takes no pointers.
    check(unsafe { libc::socket(family, libc::SOCK_STREAM, 0) })
}

/// Probe whether the process is at its descriptor limit by creating and
/// immediately closing a throwaway socket.
pub(crate) fn at_fd_limit() -> bool {
    // SAFETY: socket(2) takes no pointers; the probe descriptor is closed
    // right away.
    let probe = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if probe >= 0 {
        unsafe { libc::close(probe) };
        return false;
    }
    matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

/// Enable or disable Nagle's algorithm.
pub(crate) fn set_tcp_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    let flag: libc::c_int = if enable { 1 } else { 0 };
    // SAFETY: the option value points at a live c_int of the given size.
    check(unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            (&flag as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Switch a descriptor between blocking and non-blocking mode.
pub(crate) fn set_blocking(fd: RawFd, blocking: bool) -> io::Result<()> {
    // SAFETY: F_GETFL takes no pointer argument.
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    // SAFETY: F_SETFL with an int argument.
    check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
    Ok(())
}

/// Read the pending socket error, consuming it. Returns 0 when the socket
/// carries no error.
pub(crate) fn so_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: err/len point at live storage of the advertised size.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return io::Error::last_os_error().raw_os_error().unwrap_or(-1);
    }
    err
}

/// Shut down both directions of a connected socket. Errors are ignored:
/// the descriptor may already be half dead.
pub(crate) fn shutdown(fd: RawFd) {
    if fd == INVALID_SOCKET {
        return;
    }
    // SAFETY: shutdown(2) takes no pointers.
    unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
}

/// Close a descriptor. Errors are ignored.
pub(crate) fn close(fd: RawFd) {
    if fd == INVALID_SOCKET {
        return;
    }
    // SAFETY: fd is owned by the caller and closed exactly once.
    unsafe { libc::close(fd) };
}

/// Default send implementation: plain `send(2)`.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: the pointer and length describe the caller's buffer.
    check_len(unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), 0) })
}

/// Default receive implementation: plain `recv(2)`.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the pointer and length describe the caller's buffer.
    check_len(unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) })
}

/// Start a TCP connect toward `addr` on a (possibly non-blocking)
/// descriptor.
fn connect_addr(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sin is a fully initialised sockaddr_in of the
            // advertised length.
            check(unsafe {
                libc::connect(
                    fd,
                    (&sin as *const libc::sockaddr_in).cast(),
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            })?;
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sin6 is a fully initialised sockaddr_in6 of the
            // advertised length.
            check(unsafe {
                libc::connect(
                    fd,
                    (&sin6 as *const libc::sockaddr_in6).cast(),
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            })?;
        }
    }
    Ok(())
}

/// Format the local address of a connected socket as `(addr, port)`.
pub(crate) fn local_endpoint(fd: RawFd) -> io::Result<(String, u16)> {
    endpoint(fd, false)
}

/// Format the remote address of a connected socket as `(addr, port)`.
pub(crate) fn peer_endpoint(fd: RawFd) -> io::Result<(String, u16)> {
    endpoint(fd, true)
}

fn endpoint(fd: RawFd, peer: bool) -> io::Result<(String, u16)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len point at live storage of the advertised size.
    let rc = unsafe {
        if peer {
            libc::getpeername(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
        } else {
            libc::getsockname(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
        }
    };
    check(rc)?;

    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the kernel filled a sockaddr_in for AF_INET.
            let sin: &libc::sockaddr_in =
                unsafe { &*(&storage as *const libc::sockaddr_storage).cast() };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok((ip.to_string(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            // SAFETY: the kernel filled a sockaddr_in6 for AF_INET6.
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(&storage as *const libc::sockaddr_storage).cast() };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok((ip.to_string(), u16::from_be(sin6.sin6_port)))
        }
        other => Err(io::Error::other(format!("unexpected address family {other}"))),
    }
}

/// Wait for a descriptor to become ready, polling through the context's
/// configured I/O mechanism in bounded rounds until `timeout` elapses.
///
/// On readiness the pending socket error is probed with `SO_ERROR`: some
/// platforms report a failed non-blocking connect as writable, so the
/// probe is not optional. Returns the portion of `timeout` left.
pub(crate) fn wait_on(
    ctx: &Context,
    direction: WaitDirection,
    fd: RawFd,
    timeout: Duration,
) -> Result<Duration> {
    if timeout.is_zero() {
        return Err(Error::Connection(
            "requested a wait operation with a zero wait period".into(),
        ));
    }

    set_blocking(fd, false)?;
    let mut set = WaitSet::new(ctx.io_mechanism(), direction, ctx.hard_sock_limit());
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            return Err(Error::Connection(
                "timed out waiting for socket readiness".into(),
            ));
        }

        set.clear();
        if !set.add(fd, None) {
            return Err(Error::SocketSanity(
                "failed to add the socket to the waiting set".into(),
            ));
        }

        match set.wait(fd) {
            Wait::Ready(_) => {
                let err = so_error(fd);
                if err != 0 {
                    return Err(Error::Connection(format!(
                        "error level set on waiting socket: {}",
                        io::Error::from_raw_os_error(err)
                    )));
                }
                return Ok(deadline.saturating_duration_since(Instant::now()));
            }
            Wait::Timeout | Wait::Interrupted | Wait::SoftError => continue,
            Wait::Fatal => {
                return Err(Error::Connection(
                    "unrecoverable failure while waiting for socket readiness".into(),
                ));
            }
        }
    }
}

/// Create a plain TCP connection toward `host:port`.
///
/// Resolution goes through the context's cached resolver. The connect is
/// started non-blocking; `EINPROGRESS` is expected and the call then waits
/// for write readiness under the configured connect timeout, probing
/// `SO_ERROR` before declaring victory. Returns the connected descriptor
/// (still non-blocking) and the portion of the timeout that remains for
/// the greetings exchange.
pub fn sock_connect(
    ctx: &Context,
    host: &str,
    port: u16,
    transport: Transport,
) -> Result<(RawFd, Duration)> {
    let addrs = ctx.resolver().resolve(host, port, transport)?;
    let addr = addrs
        .first()
        .ok_or_else(|| Error::NameResolution(format!("no usable address for {host}:{port}")))?;

    if at_fd_limit() {
        return Err(Error::SocketSanity(
            "unable to create more connections, socket limit reached".into(),
        ));
    }

    let fd = create(transport)
        .map_err(|e| Error::NameResolution(format!("unable to create socket: {e}")))?;

    if let Err(e) = configure_new_socket(ctx, fd) {
        shutdown(fd);
        close(fd);
        return Err(e);
    }

    let timeout = ctx.connect_timeout();
    match connect_addr(fd, addr) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            shutdown(fd);
            close(fd);
            return Err(Error::Connection(format!(
                "unable to connect to remote host {host}:{port}: {e}"
            )));
        }
    }

    match wait_on(ctx, WaitDirection::Write, fd, timeout) {
        Ok(remaining) => Ok((fd, remaining)),
        Err(e) => {
            shutdown(fd);
            close(fd);
            Err(Error::Connection(format!(
                "unable to connect to remote host {host}:{port}: {e}"
            )))
        }
    }
}

/// Create a listening TCP socket bound to `host:port`. Returns the bound
/// descriptor; with port 0 the kernel picks one (readable afterwards via
/// `local_endpoint`).
pub(crate) fn listen_on(
    ctx: &Context,
    host: &str,
    port: u16,
    transport: Transport,
) -> Result<RawFd> {
    let addrs = ctx.resolver().resolve(host, port, transport)?;
    let addr = addrs
        .first()
        .ok_or_else(|| Error::NameResolution(format!("no usable address for {host}:{port}")))?;

    let fd = create(transport)
        .map_err(|e| Error::NameResolution(format!("unable to create socket: {e}")))?;

    let reuse: libc::c_int = 1;
    // SAFETY: the option value points at a live c_int of the given size.
    let _ = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&reuse as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    let bound = bind_addr(fd, addr).and_then(|()| {
        // SAFETY: listen(2) takes no pointers.
        check(unsafe { libc::listen(fd, 128) }).map(|_| ())
    });
    if let Err(e) = bound {
        close(fd);
        return Err(Error::Connection(format!(
            "unable to listen on {host}:{port}: {e}"
        )));
    }
    Ok(fd)
}

fn bind_addr(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sin is a fully initialised sockaddr_in of the
            // advertised length.
            check(unsafe {
                libc::bind(
                    fd,
                    (&sin as *const libc::sockaddr_in).cast(),
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            })?;
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sin6 is a fully initialised sockaddr_in6 of the
            // advertised length.
            check(unsafe {
                libc::bind(
                    fd,
                    (&sin6 as *const libc::sockaddr_in6).cast(),
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            })?;
        }
    }
    Ok(())
}

/// Accept one connection on a listening socket, blocking until a peer
/// arrives.
pub(crate) fn accept(fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: null address arguments are allowed; the peer address is
    // queried later via getpeername.
    check(unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) })
}

/// Apply the per-socket setup shared by connect and accept paths: sanity
/// checks, configured limits, Nagle off, non-blocking.
pub(crate) fn configure_new_socket(ctx: &Context, fd: RawFd) -> Result<()> {
    if ctx.sanity_checks_enabled() && fd <= 2 {
        return Err(Error::SocketSanity(format!(
            "created socket descriptor using a reserved descriptor ({fd}), \
             this is likely to cause troubles"
        )));
    }
    let hard_limit = ctx.hard_sock_limit();
    if hard_limit > 0 && fd as usize >= hard_limit {
        return Err(Error::SocketSanity(format!(
            "socket descriptor {fd} beyond the configured hard limit {hard_limit}"
        )));
    }
    set_tcp_nodelay(fd, true)?;
    set_blocking(fd, false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_and_endpoints() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let ctx = Context::new();
        let (fd, remaining) = sock_connect(&ctx, "127.0.0.1", port, Transport::Ipv4).unwrap();
        assert!(remaining > Duration::ZERO);

        let (local_ip, local_port) = local_endpoint(fd).unwrap();
        assert_eq!(local_ip, "127.0.0.1");
        assert!(local_port > 0);

        let (peer_ip, peer_port) = peer_endpoint(fd).unwrap();
        assert_eq!(peer_ip, "127.0.0.1");
        assert_eq!(peer_port, port);

        shutdown(fd);
        close(fd);
    }

    #[test]
    fn test_connect_refused() {
        let ctx = Context::new();
        // Bind then drop to get a port that very likely refuses.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = sock_connect(&ctx, "127.0.0.1", port, Transport::Ipv4).unwrap_err();
        assert_eq!(err.status(), crate::peer::Status::ConnectionError);
    }

    #[test]
    fn test_blocking_mode_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let ctx = Context::new();
        let (fd, _) = sock_connect(&ctx, "127.0.0.1", port, Transport::Ipv4).unwrap();

        // The connect path leaves the socket non-blocking; flipping it
        // back and forth must succeed.
        set_blocking(fd, true).unwrap();
        set_blocking(fd, false).unwrap();
        close(fd);
    }

    #[test]
    fn test_wait_on_rejects_zero_period() {
        let ctx = Context::new();
        assert!(wait_on(&ctx, WaitDirection::Read, 0, Duration::ZERO).is_err());
    }
}
