//! Byte transports underneath [`Connection`](crate::Connection).
//!
//! The protocol engine never touches a socket. A [`Transport`] moves bytes
//! in and out and, when the handshake asks for it, upgrades itself to TLS.
//! [`MySqlStream`] is the stock TCP implementation; tests and embedders can
//! supply their own.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;
use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};
use sqlwire_core::{Error, Result};

use crate::config::{MySqlConfig, TlsOptions};
use crate::error::ssl_error;

/// An ordered, reliable byte stream to a MySQL server.
pub trait Transport: Send {
    /// Read whatever is available. `Ok(0)` means the peer closed.
    fn read_some(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Run a TLS client handshake over the current stream and encrypt all
    /// traffic from here on.
    fn upgrade_tls(
        &mut self,
        server_name: &str,
        options: &TlsOptions,
    ) -> impl Future<Output = Result<()>> + Send {
        let _ = (server_name, options);
        async { Err(ssl_error("transport does not support TLS")) }
    }

    fn is_secure(&self) -> bool {
        false
    }
}

/// TCP stream to a MySQL server, optionally wrapped in TLS.
pub enum MySqlStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<crate::tls::TlsStream>),
    /// Placeholder while the plain stream is moved into a TLS session.
    #[cfg(feature = "tls")]
    Closed,
}

impl std::fmt::Debug for MySqlStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MySqlStream::Plain(_) => f.write_str("MySqlStream::Plain"),
            #[cfg(feature = "tls")]
            MySqlStream::Tls(s) => write!(f, "MySqlStream::Tls({s:?})"),
            #[cfg(feature = "tls")]
            MySqlStream::Closed => f.write_str("MySqlStream::Closed"),
        }
    }
}

impl MySqlStream {
    /// Open a TCP connection to the configured host.
    pub async fn connect(config: &MySqlConfig) -> Result<Self> {
        if let Some(path) = &config.socket {
            return Err(Error::config(format!(
                "unix socket '{}' needs a caller-supplied transport",
                path.display()
            )));
        }

        let addr = config.socket_addr();
        let socket_addr = resolve(&addr)?;
        let stream = match TcpStream::connect_timeout(socket_addr, config.connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                    ConnectionErrorKind::Refused
                } else {
                    ConnectionErrorKind::Connect
                };
                return Err(Error::Connection(ConnectionError {
                    kind,
                    message: format!("failed to connect to {addr}: {e}"),
                    source: Some(Box::new(e)),
                }));
            }
        };

        stream.set_nodelay(true).ok();
        tracing::debug!(%addr, "tcp connected");
        Ok(MySqlStream::Plain(stream))
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    let mut addrs = addr.to_socket_addrs().map_err(|e| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("cannot resolve {addr}: {e}"),
            source: Some(Box::new(e)),
        })
    })?;
    addrs.next().ok_or_else(|| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("no address found for {addr}"),
            source: None,
        })
    })
}

#[cfg(feature = "tls")]
fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl Transport for MySqlStream {
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MySqlStream::Plain(s) => read_some_plain(s, buf).await,
            #[cfg(feature = "tls")]
            MySqlStream::Tls(s) => s.read_plain(buf).await,
            #[cfg(feature = "tls")]
            MySqlStream::Closed => Err(closed()),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            MySqlStream::Plain(s) => write_all_plain(s, buf).await,
            #[cfg(feature = "tls")]
            MySqlStream::Tls(s) => s.write_all(buf).await,
            #[cfg(feature = "tls")]
            MySqlStream::Closed => Err(closed()),
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            MySqlStream::Plain(s) => flush_plain(s).await,
            #[cfg(feature = "tls")]
            MySqlStream::Tls(s) => s.flush().await,
            #[cfg(feature = "tls")]
            MySqlStream::Closed => Err(closed()),
        }
    }

    #[cfg(feature = "tls")]
    async fn upgrade_tls(&mut self, server_name: &str, options: &TlsOptions) -> Result<()> {
        match std::mem::replace(self, MySqlStream::Closed) {
            MySqlStream::Plain(tcp) => {
                let tls = crate::tls::TlsStream::handshake(tcp, server_name, options).await?;
                *self = MySqlStream::Tls(Box::new(tls));
                Ok(())
            }
            other => {
                *self = other;
                Err(ssl_error("stream is not a plain TCP connection"))
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn upgrade_tls(&mut self, _server_name: &str, _options: &TlsOptions) -> Result<()> {
        Err(ssl_error(
            "TLS requested but 'sqlwire-mysql' was built without feature 'tls'",
        ))
    }

    fn is_secure(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            matches!(self, MySqlStream::Tls(_))
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }
}

pub(crate) async fn read_some_plain(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut read_buf = ReadBuf::new(buf);
    std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_read(cx, &mut read_buf)).await?;
    Ok(read_buf.filled().len())
}

pub(crate) async fn write_all_plain(stream: &mut TcpStream, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_write(cx, &buf[written..]))
            .await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed",
            ));
        }
        written += n;
    }
    Ok(())
}

pub(crate) async fn flush_plain(stream: &mut TcpStream) -> io::Result<()> {
    std::future::poll_fn(|cx| Pin::new(&mut *stream).poll_flush(cx)).await
}
