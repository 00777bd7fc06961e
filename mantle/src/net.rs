//! Socket construction for the relay: listeners with the options the
//! protocol needs, and non-blocking target connects with optional TCP Fast
//! Open carrying the first payload bytes.

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::Buffer;
use crate::logging::{self, Logger};

const LISTEN_BACKLOG: i32 = 1024;

/// Builds a listening socket bound to `addr`. Wildcard IPv6 binds dual-stack;
/// an explicit IPv6 host binds v6-only.
pub fn bind_listener(addr: SocketAddr, fast_open: bool, log: &Logger) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if socket.set_reuse_port(true).is_ok() {
        logging::debug!(log, "port reuse enabled"; "addr" => %addr);
    }
    if let SocketAddr::V6(v6) = addr {
        socket.set_only_v6(!v6.ip().is_unspecified())?;
    }

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    if fast_open {
        set_fastopen(&socket, log);
    }

    TcpListener::from_std(socket.into())
}

/// Opens a non-blocking connection to the target. With fast open enabled the
/// pending bytes of `initial` ride in the SYN and the buffer is advanced by
/// whatever the kernel accepted.
pub fn connect_target(
    addr: SocketAddr,
    iface: Option<&str>,
    fast_open: bool,
    initial: &mut Buffer,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    bind_iface(&socket, iface)?;

    if fast_open {
        fastopen_connect(&socket, &addr, initial)?;
    } else {
        plain_connect(&socket, &addr)?;
    }

    TcpStream::from_stream(socket.into())
}

fn plain_connect(socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
    match socket.connect(&(*addr).into()) {
        Ok(()) => Ok(()),
        Err(ref e) if in_progress(e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(target_os = "linux")]
fn bind_iface(socket: &Socket, iface: Option<&str>) -> io::Result<()> {
    match iface {
        Some(name) => socket.bind_device(Some(name.as_bytes())),
        None => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_iface(_socket: &Socket, _iface: Option<&str>) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_fastopen(socket: &Socket, log: &Logger) {
    use std::os::unix::io::AsRawFd;

    let qlen: libc::c_int = 5;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &qlen as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        logging::warn!(log, "fast open is not supported on this platform";
                       "error" => %io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn set_fastopen(_socket: &Socket, log: &Logger) {
    logging::warn!(log, "fast open is not supported on this platform");
}

#[cfg(target_os = "linux")]
fn fastopen_connect(socket: &Socket, addr: &SocketAddr, initial: &mut Buffer) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let raw = socket2::SockAddr::from(*addr);
    let data = initial.pending();
    let rc = unsafe {
        libc::sendto(
            socket.as_raw_fd(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_FASTOPEN,
            raw.as_ptr(),
            raw.len(),
        )
    };

    if rc >= 0 {
        initial.advance(rc as usize);
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // no cookie yet or still in flight: the kernel falls back to a
        // conventional handshake and the data stays queued here
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => Ok(()),
        Some(libc::EOPNOTSUPP) | Some(libc::EPROTONOSUPPORT) | Some(libc::ENOPROTOOPT) => {
            plain_connect(socket, addr)
        }
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
fn fastopen_connect(socket: &Socket, addr: &SocketAddr, _initial: &mut Buffer) -> io::Result<()> {
    plain_connect(socket, addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_bind_listener_ephemeral() {
        let log = crate::logging::discard();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = bind_listener(addr, false, &log).unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn test_connect_target_completes() {
        let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut initial = Buffer::new(16);
        let stream = connect_target(addr, None, false, &mut initial).unwrap();

        let (mut accepted, _) = server.accept().unwrap();
        accepted.write_all(b"ok").unwrap();
        drop(stream);
    }
}
