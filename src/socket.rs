//! Turns an [`Endpoint`] plus [`SocketOptions`] into a connected, optionally
//! TLS-wrapped, boxed stream that [`crate::connection::Connection`] can
//! frame.
//!
//! Socket options are applied through `socket2`, the same crate the larger
//! async Redis clients in the ecosystem reach for (see DESIGN.md); anything
//! `socket2` doesn't expose portably (`TCP_USER_TIMEOUT`) is set directly
//! through a `libc::setsockopt` call gated to Unix targets.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

#[cfg(test)]
use socket2::SockRef;
use socket2::{Domain, Socket as Socket2, TcpKeepalive, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

use crate::options::{Endpoint, IpPreference, SocketOptions};
use crate::{Error, Result};

/// A connected stream, erased behind a trait object so `Connection<Stream>`
/// doesn't need a type parameter per transport.
pub struct Stream(Pin<Box<dyn AsyncReadWrite>>);

trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.as_mut().poll_shutdown(cx)
    }
}

/// Resolves `endpoint`, connects, applies `options`, and (behind the `tls`
/// feature, when `options.tls` is set) performs the TLS handshake.
pub async fn connect(endpoint: &Endpoint, options: &SocketOptions) -> Result<Stream> {
    match endpoint {
        Endpoint::Tcp { host, port } => connect_tcp(host, *port, options).await,
        Endpoint::Unix { path } => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(Error::connect_failed)?;
            Ok(Stream(Box::pin(stream)))
        }
    }
}

#[cfg(feature = "tls")]
async fn connect_tcp(host: &str, port: u16, options: &SocketOptions) -> Result<Stream> {
    let stream = connect_tcp_raw(host, port, options).await?;
    match &options.tls {
        Some(config) => wrap_tls(stream, host, config.clone()).await,
        None => Ok(Stream(Box::pin(stream))),
    }
}

#[cfg(not(feature = "tls"))]
async fn connect_tcp(host: &str, port: u16, options: &SocketOptions) -> Result<Stream> {
    let stream = connect_tcp_raw(host, port, options).await?;
    Ok(Stream(Box::pin(stream)))
}

async fn connect_tcp_raw(host: &str, port: u16, options: &SocketOptions) -> Result<TcpStream> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(Error::connect_failed)?
        .filter(|addr| match options.ip_preference {
            IpPreference::Any => true,
            IpPreference::V4 => addr.is_ipv4(),
            IpPreference::V6 => addr.is_ipv6(),
        })
        .collect::<Vec<SocketAddr>>();

    let addr = addrs
        .into_iter()
        .next()
        .ok_or_else(|| Error::connect_failed("no address matched the configured IP preference"))?;

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket2::new(domain, Type::STREAM, None).map_err(Error::connect_failed)?;
    apply_pre_connect_options(&socket, options)?;
    socket.set_nonblocking(true).map_err(Error::connect_failed)?;

    if let Some(source) = options.source_addr {
        let bind_addr: SocketAddr = (source, 0).into();
        socket.bind(&bind_addr.into()).map_err(Error::connect_failed)?;
    }

    // socket2's connect is synchronous; a nonblocking socket returns
    // WouldBlock immediately and tokio::net::TcpStream takes it from there.
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_eintr()) => {}
        Err(e) => return Err(Error::connect_failed(e)),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream).map_err(Error::connect_failed)?;
    stream.writable().await.map_err(Error::connect_failed)?;
    if let Some(err) = stream.take_error().map_err(Error::connect_failed)? {
        return Err(Error::connect_failed(err));
    }

    apply_post_connect_options(&stream, options)?;

    Ok(stream)
}

#[cfg(unix)]
fn libc_eintr() -> i32 {
    libc::EINPROGRESS
}

#[cfg(not(unix))]
fn libc_eintr() -> i32 {
    0
}

fn apply_pre_connect_options(socket: &Socket2, options: &SocketOptions) -> Result<()> {
    if options.reuseaddr {
        socket.set_reuse_address(true).map_err(Error::connect_failed)?;
    }
    #[cfg(unix)]
    if options.cloexec {
        socket.set_cloexec(true).map_err(Error::connect_failed)?;
    }
    if let Some(interval) = options.keepalive {
        let keepalive = TcpKeepalive::new().with_time(interval);
        socket.set_tcp_keepalive(&keepalive).map_err(Error::connect_failed)?;
    }
    Ok(())
}

fn apply_post_connect_options(stream: &TcpStream, options: &SocketOptions) -> Result<()> {
    stream.set_nodelay(true).map_err(Error::connect_failed)?;

    if let Some(timeout) = options.tcp_user_timeout {
        set_tcp_user_timeout(stream, timeout)?;
    }

    Ok(())
}

/// `TCP_USER_TIMEOUT` has no portable accessor in `socket2`; it is
/// Linux-specific, so this is a no-op on every other target.
#[cfg(target_os = "linux")]
fn set_tcp_user_timeout(stream: &TcpStream, timeout: Duration) -> Result<()> {
    use std::os::fd::AsRawFd;

    let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
    let fd = stream.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_USER_TIMEOUT,
            &millis as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::connect_failed(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_user_timeout(_stream: &TcpStream, _timeout: Duration) -> Result<()> {
    Ok(())
}

/// Exposed for tests that want to assert the underlying fd got the options
/// they expect without reaching into `socket2` themselves.
#[cfg(test)]
pub(crate) fn sockref(stream: &TcpStream) -> SockRef<'_> {
    SockRef::from(stream)
}

#[cfg(feature = "tls")]
pub async fn wrap_tls(
    stream: TcpStream,
    server_name: &str,
    config: std::sync::Arc<rustls::ClientConfig>,
) -> Result<Stream> {
    use tokio_rustls::TlsConnector;

    let connector = TlsConnector::from(config);
    let domain = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::connect_failed(e))?;
    let tls_stream = connector
        .connect(domain, stream)
        .await
        .map_err(Error::connect_failed)?;
    Ok(Stream(Box::pin(tls_stream)))
}
