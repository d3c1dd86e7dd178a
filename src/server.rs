//! Connection-multiplexing server runtime.
//!
//! Owns the listening socket and the registry of live clients, drives a
//! readiness loop over them, and hands every received chunk to the
//! embedding application through the [`EventHandler`] callbacks.
//!
//! Single-threaded and synchronous: one `poll` call is the only suspension
//! point, and every accept/receive/callback runs to completion before the
//! next wait. Shutdown is cooperative: an atomic flag checked between
//! passes, paired with a [`mio::Waker`] in the poll set so a stop request
//! from a signal handler or another thread interrupts the wait.

use crate::config::Config;
use crate::registry::{Registry, RegistryError, DEFAULT_CAPACITY};
use crate::sock::{Connection, Listener, SockError};
use bytes::BytesMut;
use mio::{Events, Poll, Token, Waker};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Payload written to every client immediately after accept.
pub const WELCOME: &[u8] = b"Successfully connected to server!\n";

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

const EVENTS_CAPACITY: usize = 128;

/// Server-layer failure categories.
///
/// The socket taxonomy re-exposed one layer up: every [`SockError`] maps to
/// exactly one variant here, and anything the lower layers did not classify
/// lands in [`ServerError::Unspecified`].
#[derive(Debug)]
pub enum ServerError {
    /// A socket handle was invalid or not connected.
    Socket,
    /// A bind host or port was rejected.
    Address,
    /// An OS-level socket or poll operation failed.
    Op(io::Error),
    /// The peer ended the connection.
    Closed,
    /// Backing storage for the client registry could not be allocated.
    OutOfMemory,
    /// Anything the lower layers did not classify.
    Unspecified,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Socket => write!(f, "invalid or unconnected socket"),
            ServerError::Address => write!(f, "invalid address or port"),
            ServerError::Op(e) => write!(f, "socket operation failed: {e}"),
            ServerError::Closed => write!(f, "connection closed by peer"),
            ServerError::OutOfMemory => write!(f, "client registry allocation failed"),
            ServerError::Unspecified => write!(f, "unspecified server error"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Op(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SockError> for ServerError {
    fn from(err: SockError) -> Self {
        match err {
            SockError::NotConnected => ServerError::Socket,
            SockError::BadAddress => ServerError::Address,
            SockError::Op(e) => ServerError::Op(e),
            SockError::Closed => ServerError::Closed,
        }
    }
}

impl From<RegistryError> for ServerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Alloc => ServerError::OutOfMemory,
            _ => ServerError::Unspecified,
        }
    }
}

/// Flags returned by [`EventHandler::on_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataOutcome {
    /// Something went wrong while handling this chunk; informational.
    pub client_error: bool,
    /// Tear the client down once the callback returns.
    pub disconnect: bool,
}

impl DataOutcome {
    /// No flags set: keep the client.
    pub const SUCCESS: Self = Self {
        client_error: false,
        disconnect: false,
    };

    /// Request teardown of this client after the callback returns.
    pub const DISCONNECT: Self = Self {
        client_error: false,
        disconnect: true,
    };

    pub fn with_client_error(mut self) -> Self {
        self.client_error = true;
        self
    }
}

/// Application callbacks invoked by the event loop.
///
/// `on_data` is the only mandatory hook; the lifecycle hooks default to
/// no-ops so embedders opt in per event.
pub trait EventHandler {
    /// A client connected and was sent the welcome payload.
    fn on_connected(&mut self, _client: &mut Connection) {}

    /// A chunk of bytes arrived from `client`.
    ///
    /// At most one receive-buffer's worth per call; a longer message
    /// arrives as further independent calls with no reassembly.
    fn on_data(&mut self, client: &mut Connection, data: &[u8]) -> DataOutcome;

    /// Receiving from `client` failed; the client is torn down afterwards.
    fn on_error(&mut self, _client: &mut Connection, _err: &ServerError) {}

    /// A client was closed and removed. Nothing can be sent to it anymore.
    fn on_disconnected(&mut self, _peer: Option<SocketAddr>) {}
}

/// Requests loop termination from outside the server thread.
///
/// `request_stop` performs only an atomic store and a waker write, so it is
/// safe to call from a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    /// Whether a stop has been requested yet.
    #[allow(dead_code)] // embedder surface, exercised by tests
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// One registry entry: the poll token routing events to this client, plus
/// the connection itself. Tokens stay stable across registry compaction.
struct Client {
    token: usize,
    conn: Connection,
}

/// The multiplexing server.
pub struct Server<H: EventHandler> {
    poll: Poll,
    listener: Listener,
    clients: Registry<Client>,
    handler: H,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    next_token: usize,
    recv_buf: BytesMut,
    max_clients: usize,
}

impl<H: EventHandler> Server<H> {
    /// Bind the listening socket and prepare the poll set.
    pub fn bind(config: &Config, handler: H) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Op)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Op)?);

        let mut listener = Listener::open(&config.host, config.port, config.backlog)?;
        listener
            .register(poll.registry(), LISTENER_TOKEN)
            .map_err(ServerError::Op)?;

        let clients = Registry::with_capacity(DEFAULT_CAPACITY)?;

        let mut recv_buf = BytesMut::with_capacity(config.recv_buffer);
        recv_buf.resize(config.recv_buffer, 0);

        info!(
            host = %config.host,
            port = listener.port(),
            backlog = config.backlog,
            max_clients = config.max_clients,
            "server listening"
        );

        Ok(Self {
            poll,
            listener,
            clients,
            handler,
            running: Arc::new(AtomicBool::new(true)),
            waker,
            next_token: FIRST_CLIENT_TOKEN,
            recv_buf,
            max_clients: config.max_clients,
        })
    }

    /// Handle used to stop the loop from another thread or a signal handler.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Drive the readiness loop until a stop is requested, then tear down
    /// every client and the listener.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                // A signal interrupting the wait restarts the pass so the
                // running flag is re-checked.
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.teardown();
                return Err(ServerError::Op(e));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_pending(),
                    WAKER_TOKEN => {} // loop condition re-checks the flag
                    Token(token) => self.service_client(token),
                }
            }
        }

        self.teardown();
        Ok(())
    }

    /// Drain the accept queue. Failures are logged and never stop the loop.
    fn accept_pending(&mut self) {
        loop {
            let mut conn = match self.listener.accept() {
                Ok(Some(conn)) => conn,
                Ok(None) => break, // queue drained
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };

            let peer = conn.peer();

            if self.clients.len() >= self.max_clients {
                warn!(
                    peer = ?peer,
                    limit = self.max_clients,
                    "client limit reached, dropping connection"
                );
                conn.close();
                continue;
            }

            // Best-effort: a failed welcome send never aborts the accept.
            if let Err(e) = conn.send(WELCOME) {
                warn!(peer = ?peer, error = %e, "welcome send failed");
            }

            let token = self.alloc_token();
            if let Err(e) = self.clients.push(Client { token, conn }) {
                error!(peer = ?peer, error = %e, "registry push failed, dropping connection");
                continue;
            }

            let index = self.clients.len() - 1;
            let client = match self.clients.get_mut(index) {
                Ok(client) => client,
                Err(_) => continue,
            };

            if let Err(e) = client.conn.register(self.poll.registry(), Token(token)) {
                error!(peer = ?peer, error = %e, "poll registration failed, dropping connection");
                client.conn.close();
                let _ = self.clients.remove(index);
                continue;
            }

            debug!(token, peer = ?peer, fd = ?client.conn.fd(), "client connected");
            self.handler.on_connected(&mut client.conn);
        }
    }

    /// Service one readable client, reading until the socket drains.
    fn service_client(&mut self, token: usize) {
        // Tokens are stable across registry compaction; an event for a
        // client removed earlier in this batch simply finds no entry.
        let Some(index) = self.clients.iter().position(|c| c.token == token) else {
            return;
        };

        loop {
            let client = match self.clients.get_mut(index) {
                Ok(client) => client,
                Err(_) => return,
            };

            match client.conn.receive(&mut self.recv_buf) {
                Ok(0) => return, // drained
                Ok(n) => {
                    debug!(token, bytes = n, "received data");
                    let outcome = self.handler.on_data(&mut client.conn, &self.recv_buf[..n]);
                    if outcome.client_error {
                        warn!(token, "handler reported a client error");
                    }
                    if outcome.disconnect {
                        debug!(token, "handler requested disconnect");
                        self.remove_client(index);
                        return;
                    }
                }
                Err(SockError::Closed) => {
                    debug!(token, "client disconnected");
                    self.remove_client(index);
                    return;
                }
                Err(e) => {
                    let err = ServerError::from(e);
                    warn!(token, error = %err, "receive failed, dropping client");
                    self.handler.on_error(&mut client.conn, &err);
                    self.remove_client(index);
                    return;
                }
            }
        }
    }

    /// Deregister, close, and drop the client at `index`, then tell the
    /// handler. The registry compacts in place, preserving order.
    fn remove_client(&mut self, index: usize) {
        let Ok(mut client) = self.clients.remove(index) else {
            return;
        };

        let peer = client.conn.peer();
        if let Err(e) = client.conn.deregister(self.poll.registry()) {
            debug!(error = %e, "deregister on removal failed");
        }
        client.conn.close();

        self.handler.on_disconnected(peer);
    }

    /// Close every live client, release the registry, close the listener.
    fn teardown(&mut self) {
        info!(clients = self.clients.len(), "server shutting down");

        while let Ok(mut client) = self.clients.pop() {
            let peer = client.conn.peer();
            if let Err(e) = client.conn.deregister(self.poll.registry()) {
                debug!(error = %e, "deregister on teardown failed");
            }
            client.conn.close();
            self.handler.on_disconnected(peer);
        }
        self.clients.destroy();

        if let Err(e) = self.listener.deregister(self.poll.registry()) {
            debug!(error = %e, "listener deregister failed");
        }
        // The listener descriptor itself is released when the server drops.
    }

    /// Next unused client token. Wraps far before colliding in practice,
    /// but skip any token still routing to a live client.
    fn alloc_token(&mut self) -> usize {
        loop {
            let token = self.next_token;
            self.next_token = self
                .next_token
                .checked_add(1)
                .unwrap_or(FIRST_CLIENT_TOKEN);

            if !self.clients.iter().any(|c| c.token == token) {
                return token;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::thread;
    use std::time::{Duration, Instant};

    const RESPONSE: &[u8] = b"Message received\n";

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected(u16),
        Data(u16, Vec<u8>),
        Disconnected(Option<u16>),
    }

    /// Forwards every callback to the test thread; echoes the fixed
    /// acknowledgement and disconnects clients that say "bye".
    struct RecordingHandler {
        events: Sender<Event>,
    }

    impl EventHandler for RecordingHandler {
        fn on_connected(&mut self, client: &mut Connection) {
            let port = client.peer_port().unwrap_or(0);
            let _ = self.events.send(Event::Connected(port));
        }

        fn on_data(&mut self, client: &mut Connection, data: &[u8]) -> DataOutcome {
            let port = client.peer_port().unwrap_or(0);
            let _ = self.events.send(Event::Data(port, data.to_vec()));

            if data == b"bye\n" {
                return DataOutcome::DISCONNECT;
            }

            let _ = client.send(RESPONSE);
            DataOutcome::SUCCESS
        }

        fn on_disconnected(&mut self, peer: Option<SocketAddr>) {
            let _ = self.events.send(Event::Disconnected(peer.map(|p| p.port())));
        }
    }

    fn test_config(port: u16) -> Config {
        Config {
            port,
            host: "127.0.0.1".to_string(),
            backlog: 10,
            max_clients: 32,
            recv_buffer: 1024,
            verbose: false,
            log_level: "info".to_string(),
        }
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[allow(clippy::type_complexity)]
    fn start_server() -> (
        u16,
        ShutdownHandle,
        Receiver<Event>,
        thread::JoinHandle<Result<(), ServerError>>,
    ) {
        let (tx, rx) = channel();
        let port = free_port();
        let server = Server::bind(&test_config(port), RecordingHandler { events: tx }).unwrap();
        let handle = server.shutdown_handle();
        let join = thread::spawn(move || server.run());
        (port, handle, rx, join)
    }

    fn connect(port: u16) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn read_welcome(stream: &mut TcpStream) {
        let mut buf = vec![0u8; WELCOME.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, WELCOME);
    }

    fn read_response(stream: &mut TcpStream) {
        let mut buf = vec![0u8; RESPONSE.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, RESPONSE);
    }

    /// Wait up to five seconds for the first event matching `pred`.
    fn next_matching(rx: &Receiver<Event>, mut pred: impl FnMut(&Event) -> bool) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for event");
            let event = rx.recv_timeout(remaining).unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_welcome_then_echo() {
        let (port, handle, rx, join) = start_server();
        let mut client = connect(port);
        let client_port = client.local_addr().unwrap().port();

        read_welcome(&mut client);
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Connected(_))),
            Event::Connected(client_port)
        );

        client.write_all(b"hi\n").unwrap();
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Data(..))),
            Event::Data(client_port, b"hi\n".to_vec())
        );
        read_response(&mut client);

        handle.request_stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_two_clients_are_isolated() {
        let (port, handle, rx, join) = start_server();

        let mut a = connect(port);
        let mut b = connect(port);
        let a_port = a.local_addr().unwrap().port();
        let b_port = b.local_addr().unwrap().port();
        read_welcome(&mut a);
        read_welcome(&mut b);

        a.write_all(b"from a\n").unwrap();
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Data(..))),
            Event::Data(a_port, b"from a\n".to_vec())
        );
        read_response(&mut a);

        b.write_all(b"from b\n").unwrap();
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Data(..))),
            Event::Data(b_port, b"from b\n".to_vec())
        );
        read_response(&mut b);

        // Disconnecting A must not disturb B.
        drop(a);
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Disconnected(_))),
            Event::Disconnected(Some(a_port))
        );

        b.write_all(b"still here\n").unwrap();
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Data(..))),
            Event::Data(b_port, b"still here\n".to_vec())
        );
        read_response(&mut b);

        handle.request_stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_abrupt_close_removes_client_exactly_once() {
        let (port, handle, rx, join) = start_server();

        let mut client = connect(port);
        let client_port = client.local_addr().unwrap().port();
        read_welcome(&mut client);
        next_matching(&rx, |e| matches!(e, Event::Connected(_)));

        drop(client);
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Disconnected(_))),
            Event::Disconnected(Some(client_port))
        );

        // No further callbacks may reference the departed client.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        handle.request_stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_handler_requested_disconnect() {
        let (port, handle, rx, join) = start_server();

        let mut client = connect(port);
        let client_port = client.local_addr().unwrap().port();
        read_welcome(&mut client);

        client.write_all(b"bye\n").unwrap();
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Data(..))),
            Event::Data(client_port, b"bye\n".to_vec())
        );
        assert_eq!(
            next_matching(&rx, |e| matches!(e, Event::Disconnected(_))),
            Event::Disconnected(Some(client_port))
        );

        // The receive succeeded, yet the server actively tore us down.
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        handle.request_stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_closes_connected_clients() {
        let (port, handle, rx, join) = start_server();

        let mut client = connect(port);
        read_welcome(&mut client);
        next_matching(&rx, |e| matches!(e, Event::Connected(_)));

        handle.request_stop();
        join.join().unwrap().unwrap();
        assert!(!handle.is_running());

        // Teardown closed us and fired the lifecycle hook.
        next_matching(&rx, |e| matches!(e, Event::Disconnected(_)));
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_error_translation_is_total() {
        assert!(matches!(
            ServerError::from(SockError::NotConnected),
            ServerError::Socket
        ));
        assert!(matches!(
            ServerError::from(SockError::BadAddress),
            ServerError::Address
        ));
        assert!(matches!(
            ServerError::from(SockError::Op(io::Error::new(io::ErrorKind::Other, "boom"))),
            ServerError::Op(_)
        ));
        assert!(matches!(
            ServerError::from(SockError::Closed),
            ServerError::Closed
        ));
        assert!(matches!(
            ServerError::from(RegistryError::Alloc),
            ServerError::OutOfMemory
        ));
        assert!(matches!(
            ServerError::from(RegistryError::OutOfBounds),
            ServerError::Unspecified
        ));
    }
}
