//! Socket plumbing shared by the listener, the pool, and the relay paths.

use crate::{Error, Result};
use bytes::BytesMut;
use socket2::{Domain, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const LISTEN_BACKLOG: i32 = 256;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Split a `host:port` target at the last colon. Returns nothing for an
/// empty host, a non-numeric port, or a port outside `1..=65535`.
pub fn parse_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

/// Open a fresh upstream connection within `connect_timeout`, with
/// `TCP_NODELAY` and keepalive enabled. Timeouts are reported as
/// [`Error::ConnectTimeout`] so the caller can answer 504 instead of 502.
pub async fn connect_upstream(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let connected = timeout(connect_timeout, TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| Error::connect_timeout(format!("connect to {addr} timed out")))?;
    let stream = connected.map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            Error::connect_timeout(format!("connect to {addr} timed out"))
        } else {
            Error::connect(format!("connect to {addr} failed: {e}"))
        }
    })?;
    configure_tcp_stream(&stream);
    Ok(stream)
}

/// Non-blocking one-byte peek deciding whether a parked socket can be reused.
///
/// Would-block means the stream is idle at a clean boundary. EOF, pending
/// readable bytes, or any error mean the socket must not be handed out again.
/// Never suspends: a pending peek resolves the probe immediately.
pub async fn socket_is_idle_usable(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    std::future::poll_fn(|cx| {
        let mut peek = ReadBuf::new(&mut byte);
        Poll::Ready(match stream.poll_peek(cx, &mut peek) {
            Poll::Ready(Ok(0)) => false,
            Poll::Ready(Ok(_)) => false,
            Poll::Ready(Err(_)) => false,
            Poll::Pending => true,
        })
    })
    .await
}

/// Read whatever is available into `buf`, bounded by `io_timeout`.
/// Returns the number of bytes read; 0 means EOF.
pub async fn read_buf_timeout<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    io_timeout: Duration,
) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    match timeout(io_timeout, stream.read_buf(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    }
}

/// Write all of `data`, bounded by `io_timeout`.
pub async fn write_all_timeout<S>(
    stream: &mut S,
    data: &[u8],
    io_timeout: Duration,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match timeout(io_timeout, stream.write_all(data)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

/// Bind the default IPv4 listener with a 256-connection backlog. The socket
/// is left non-blocking, ready for `tokio::net::TcpListener::from_std`.
pub fn bind_listener(addr: Ipv4Addr, port: u16) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(addr, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Take over a listening descriptor published by launchd under `name`.
/// Only the first descriptor is used; any extras are closed.
#[cfg(target_os = "macos")]
pub fn listener_from_launchd(name: &str) -> io::Result<std::net::TcpListener> {
    use std::os::fd::FromRawFd;

    extern "C" {
        fn launch_activate_socket(
            name: *const libc::c_char,
            fds: *mut *mut libc::c_int,
            count: *mut libc::size_t,
        ) -> libc::c_int;
    }

    let c_name = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "socket name contains NUL"))?;
    let mut fds: *mut libc::c_int = std::ptr::null_mut();
    let mut count: libc::size_t = 0;
    let rc = unsafe { launch_activate_socket(c_name.as_ptr(), &mut fds, &mut count) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    if count == 0 || fds.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("launchd published no sockets under '{name}'"),
        ));
    }
    let fd = unsafe { *fds };
    for i in 1..count {
        unsafe {
            libc::close(*fds.add(i));
        }
    }
    unsafe {
        libc::free(fds.cast());
    }
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(not(target_os = "macos"))]
pub fn listener_from_launchd(_name: &str) -> io::Result<std::net::TcpListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "socket activation requires launchd",
    ))
}
