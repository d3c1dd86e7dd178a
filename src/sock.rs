//! TCP socket layer beneath the event loop.
//!
//! Wraps mio's non-blocking sockets behind the small surface the server
//! needs: a passive [`Listener`] and the accepted [`Connection`]s it
//! produces. OS failures fold into the [`SockError`] taxonomy; the server
//! layer re-exposes them under its own categories.

#![allow(dead_code)] // Accessors and the outbound stub are part of the contract, not the loop

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

/// Lowest port the server will bind; everything below is privileged.
pub const MIN_PORT: u16 = 1024;

/// Socket-layer failure categories.
#[derive(Debug)]
pub enum SockError {
    /// The connection is not open (closed, or never established).
    NotConnected,
    /// The bind host or port is outside what the server accepts.
    BadAddress,
    /// An OS socket operation failed.
    Op(io::Error),
    /// The peer ended the connection.
    Closed,
}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockError::NotConnected => write!(f, "socket is not connected"),
            SockError::BadAddress => write!(f, "invalid address or port"),
            SockError::Op(e) => write!(f, "socket operation failed: {e}"),
            SockError::Closed => write!(f, "connection closed by peer"),
        }
    }
}

impl std::error::Error for SockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SockError::Op(e) => Some(e),
            _ => None,
        }
    }
}

/// io-error kinds that mean the peer is gone rather than a local fault.
fn peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// A passive (listening) TCP endpoint.
pub struct Listener {
    inner: TcpListener,
    port: u16,
}

impl Listener {
    /// Open a non-blocking listening socket bound to `host:port`.
    ///
    /// Ports below [`MIN_PORT`] are refused with [`SockError::BadAddress`];
    /// the upper bound is the `u16` maximum. `backlog` bounds the pending
    /// connection queue.
    pub fn open(host: &str, port: u16, backlog: u32) -> Result<Self, SockError> {
        if port < MIN_PORT {
            return Err(SockError::BadAddress);
        }

        let ip: IpAddr = host.parse().map_err(|_| SockError::BadAddress)?;
        let addr = SocketAddr::new(ip, port);

        let socket = Socket::new(
            match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            },
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(SockError::Op)?;

        socket.set_reuse_address(true).map_err(SockError::Op)?;
        socket.set_nonblocking(true).map_err(SockError::Op)?;
        socket.bind(&addr.into()).map_err(SockError::Op)?;
        socket.listen(backlog as i32).map_err(SockError::Op)?;

        Ok(Self {
            inner: TcpListener::from_std(socket.into()),
            port,
        })
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` once the pending queue is drained; the caller is
    /// expected to be driving this from a readiness loop.
    pub fn accept(&self) -> Result<Option<Connection>, SockError> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => return Ok(Some(Connection::accepted(stream, peer))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SockError::Op(e)),
            }
        }
    }

    /// Port this listener was opened on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr().ok()
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub(crate) fn register(&mut self, registry: &mio::Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }
}

/// One accepted peer connection.
///
/// The stream is released on [`close`](Connection::close) or on drop;
/// a closed `Connection` refuses I/O with [`SockError::NotConnected`] and
/// returns sentinel values from its accessors.
pub struct Connection {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl Connection {
    fn accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer: Some(peer),
        }
    }

    /// Open an outbound connection to `remote_ip:remote_port`.
    ///
    /// TODO: implement outbound connect; nothing in the server drives it yet.
    pub fn connect(_remote_ip: &str, _remote_port: u16) -> Result<Self, SockError> {
        Err(SockError::Op(io::Error::new(
            io::ErrorKind::Unsupported,
            "outbound connect is not implemented",
        )))
    }

    /// Attempt one write of `buf`.
    ///
    /// Returns the bytes actually written, which may be fewer than
    /// `buf.len()`; an empty `buf` is a no-op reporting zero, and a write
    /// that would block also reports zero so the caller may retry.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        let stream = self.stream.as_mut().ok_or(SockError::NotConnected)?;

        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match stream.write(buf) {
                Ok(0) => return Err(SockError::Closed),
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if peer_gone(e) => return Err(SockError::Closed),
                Err(e) => return Err(SockError::Op(e)),
            }
        }
    }

    /// Attempt one read into `buf`.
    ///
    /// Returns the bytes read; zero means the socket had nothing pending
    /// (the readiness event is drained). EOF reports [`SockError::Closed`].
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        let stream = self.stream.as_mut().ok_or(SockError::NotConnected)?;

        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match stream.read(buf) {
                Ok(0) => return Err(SockError::Closed),
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if peer_gone(e) => return Err(SockError::Closed),
                Err(e) => return Err(SockError::Op(e)),
            }
        }
    }

    /// Full-duplex shutdown, then release the descriptor and reset the peer
    /// fields. No-op on an already closed connection.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(error = %e, "shutdown on close failed");
            }
        }
        self.peer = None;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Peer socket address, or `None` once closed.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.peer.map(|p| p.ip())
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.peer.map(|p| p.port())
    }

    /// Raw descriptor, or `None` once closed.
    pub fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn register(&mut self, registry: &mio::Registry, token: Token) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))?;
        registry.register(stream, token, Interest::READABLE)
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))?;
        registry.deregister(stream)
    }
}
