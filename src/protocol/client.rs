use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpStream},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, error, warn};
use thiserror::Error;

use super::{
    ProtocolTransport,
    frame::{self, FrameError},
    transport::TransportError,
};

/// How many times one pooled connection may be re-dialed before it is
/// dropped from the pool.
pub const MAX_RECONNECT_COUNT: u32 = 3;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unable to connect to {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("can't reconnect to {addr}: {source}")]
    Reconnect { addr: String, source: io::Error },

    #[error("max number of attempts reached for {addr}: {source}")]
    Exhausted {
        addr: String,
        source: TransportError,
    },

    #[error("connection to {addr} is closed")]
    Closed { addr: String },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Whether the failure ended the connection it happened on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::Reconnect { .. } | ClientError::Exhausted { .. } | ClientError::Closed { .. }
        )
    }
}

/// Dials outbound connections for a [`ConnectionPool`].
pub trait Connector: Send + Sync + 'static {
    type Stream: Read + Write + Send + 'static;

    fn connect(&self, port: u16) -> io::Result<Self::Stream>;
}

/// Connects to `127.0.0.1:<port>` over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((Ipv4Addr::LOCALHOST, port))
    }
}

fn target(port: u16) -> String {
    format!("{}:{port}", Ipv4Addr::LOCALHOST)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Set while [`ClientConnection::send`] re-dials. Callers only see it
    /// through the pool if a connector panicked mid-dial; the pool treats
    /// such a connection as stale and dials a fresh one.
    Reconnecting,
    Closed,
}

/// One persistent outbound connection.
///
/// The reconnect counter covers the whole lifetime of the connection and is
/// never reset by a successful request.
pub struct ClientConnection<S: Read + Write> {
    port: u16,
    transport: Option<ProtocolTransport<S>>,
    reconnect_count: u32,
    state: ConnectionState,
}

impl<S: Read + Write> ClientConnection<S> {
    pub fn new(port: u16, stream: S) -> Self {
        Self {
            port,
            transport: Some(ProtocolTransport::new(stream)),
            reconnect_count: 0,
            state: ConnectionState::Connected,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    /// Send one request and wait for its response.
    ///
    /// Write and read failures re-dial through `connector` and resend the
    /// same request, at most [`MAX_RECONNECT_COUNT`] times over the life of
    /// the connection. Framing errors are returned straight away.
    pub fn send<C>(&mut self, connector: &C, body: &[u8]) -> Result<Vec<u8>, ClientError>
    where
        C: Connector<Stream = S>,
    {
        let request = frame::encode_request(body)?;

        loop {
            let transport = self.transport.as_mut().ok_or_else(|| ClientError::Closed {
                addr: target(self.port),
            })?;

            let failure = match exchange(transport, &request) {
                Ok(raw) => return Ok(frame::decode_response(&raw)?.to_vec()),
                Err(e) => e,
            };

            if self.reconnect_count >= MAX_RECONNECT_COUNT {
                error!(
                    "giving up on {} after {} reconnects: {failure}",
                    target(self.port),
                    self.reconnect_count
                );
                self.close();
                return Err(ClientError::Exhausted {
                    addr: target(self.port),
                    source: failure,
                });
            }

            warn!(
                "request to {} failed ({failure}), reconnecting [{}/{MAX_RECONNECT_COUNT}]",
                target(self.port),
                self.reconnect_count + 1
            );
            self.reconnect(connector)?;
        }
    }

    fn reconnect<C>(&mut self, connector: &C) -> Result<(), ClientError>
    where
        C: Connector<Stream = S>,
    {
        self.state = ConnectionState::Reconnecting;
        // drop the broken socket before dialing its replacement
        self.transport = None;

        match connector.connect(self.port) {
            Ok(stream) => {
                self.transport = Some(ProtocolTransport::new(stream));
                self.reconnect_count += 1;
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(source) => {
                self.close();
                Err(ClientError::Reconnect {
                    addr: target(self.port),
                    source,
                })
            }
        }
    }

    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!("closing connection to {}", target(self.port));
        }
        self.transport = None;
        self.state = ConnectionState::Closed;
    }
}

fn exchange<S: Read + Write>(
    transport: &mut ProtocolTransport<S>,
    request: &[u8],
) -> Result<Vec<u8>, TransportError> {
    transport.write_request(request)?;
    transport.read_response_chunk()
}

pub type PooledConnection<S> = Arc<Mutex<ClientConnection<S>>>;

/// Client-side cache of one persistent connection per destination port.
///
/// A single lock guards the whole map, and it stays held while a missing
/// connection is dialed, so lookups for every port queue behind a slow dial.
pub struct ConnectionPool<C: Connector = TcpConnector> {
    connector: C,
    connections: Mutex<HashMap<u16, PooledConnection<C::Stream>>>,
}

impl ConnectionPool<TcpConnector> {
    pub fn new() -> Self {
        Self::with_connector(TcpConnector)
    }
}

impl Default for ConnectionPool<TcpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Send `body` to the service on `port` and return its response body.
    pub fn call(&self, port: u16, body: &[u8]) -> Result<Vec<u8>, ClientError> {
        loop {
            let entry = self.get(port)?;
            let mut connection = lock(&entry);

            // exhausted by another caller, or left mid-reconnect by a panic
            if connection.state() != ConnectionState::Connected {
                drop(connection);
                self.evict_entry(port, &entry);
                continue;
            }

            let result = connection.send(&self.connector, body);
            if let Err(e) = &result {
                if e.is_terminal() {
                    drop(connection);
                    self.evict_entry(port, &entry);
                }
            }
            return result;
        }
    }

    /// Look up the connection for `port`, dialing it if there is none.
    ///
    /// A failed dial leaves the pool untouched.
    pub fn get(&self, port: u16) -> Result<PooledConnection<C::Stream>, ClientError> {
        let mut connections = self.connections();

        if let Some(entry) = connections.get(&port) {
            return Ok(Arc::clone(entry));
        }

        let stream = self
            .connector
            .connect(port)
            .map_err(|source| ClientError::Dial {
                addr: target(port),
                source,
            })?;
        debug!("opened pooled connection to {}", target(port));

        let entry = Arc::new(Mutex::new(ClientConnection::new(port, stream)));
        connections.insert(port, Arc::clone(&entry));
        Ok(entry)
    }

    /// Drop the pooled connection for `port`, closing its socket.
    pub fn evict(&self, port: u16) -> bool {
        let removed = self.connections().remove(&port);
        match removed {
            Some(entry) => {
                lock(&entry).close();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.connections().contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_entry(&self, port: u16, entry: &PooledConnection<C::Stream>) {
        let mut connections = self.connections();
        if connections
            .get(&port)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            connections.remove(&port);
            debug!("evicted connection to {}", target(port));
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u16, PooledConnection<C::Stream>>> {
        lock(&self.connections)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Send a single request over a fresh connection to `host:port`.
///
/// Nothing is pooled and nothing is retried; the socket is closed on return.
pub fn send_request(host: &str, port: u16, body: &[u8]) -> Result<Vec<u8>, ClientError> {
    let addr = format!("{host}:{port}");
    let stream = TcpStream::connect(&addr).map_err(|source| ClientError::Dial { addr, source })?;

    let mut transport = ProtocolTransport::new(stream);
    let raw = exchange(&mut transport, &frame::encode_request(body)?)?;
    Ok(frame::decode_response(&raw)?.to_vec())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        net::SocketAddr,
        panic::{self, AssertUnwindSafe},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    use super::*;
    use crate::protocol::{Server, ServerConfig, ServerError, ShutdownHandle};

    /// In-memory stream that replays canned reads and can refuse writes.
    struct MockStream {
        broken: bool,
        replies: VecDeque<Vec<u8>>,
    }

    impl MockStream {
        fn broken() -> Self {
            Self {
                broken: true,
                replies: VecDeque::new(),
            }
        }

        fn replying(bodies: &[&str]) -> Self {
            Self {
                broken: false,
                replies: bodies
                    .iter()
                    .map(|b| frame::encode_response(b.as_bytes()))
                    .collect(),
            }
        }

        fn raw(reply: &[u8]) -> Self {
            Self {
                broken: false,
                replies: VecDeque::from([reply.to_vec()]),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.pop_front() {
                Some(reply) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok(reply.len())
                }
                None => Ok(0),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out queued streams; refuses to connect once the queue is empty.
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        streams: Arc<Mutex<VecDeque<MockStream>>>,
        dials: Arc<AtomicUsize>,
        panic_next: Arc<AtomicBool>,
    }

    impl ScriptedConnector {
        fn with(streams: impl IntoIterator<Item = MockStream>) -> Self {
            let connector = Self::default();
            connector.push(streams);
            connector
        }

        fn push(&self, streams: impl IntoIterator<Item = MockStream>) {
            self.streams.lock().unwrap().extend(streams);
        }

        fn panic_on_next_dial(&self) {
            self.panic_next.store(true, Ordering::SeqCst);
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    impl Connector for ScriptedConnector {
        type Stream = MockStream;

        fn connect(&self, port: u16) -> io::Result<MockStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("dial to port {port} blew up");
            }
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::ErrorKind::ConnectionRefused.into())
        }
    }

    const PORT: u16 = 7000;

    #[test]
    fn call_reuses_pooled_connection() {
        let connector = ScriptedConnector::with([MockStream::replying(&["one", "two"])]);
        let pool = ConnectionPool::with_connector(connector.clone());

        assert_eq!(pool.call(PORT, b"first").unwrap(), b"one");
        assert_eq!(pool.call(PORT, b"second").unwrap(), b"two");
        assert_eq!(connector.dials(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn reconnects_up_to_the_limit() {
        let connector = ScriptedConnector::with([
            MockStream::broken(),
            MockStream::broken(),
            MockStream::broken(),
            MockStream::replying(&["pong"]),
        ]);
        let pool = ConnectionPool::with_connector(connector.clone());

        // three failures, three reconnects, fourth attempt lands
        assert_eq!(pool.call(PORT, b"ping").unwrap(), b"pong");
        assert_eq!(connector.dials(), 4);

        let entry = pool.get(PORT).unwrap();
        assert_eq!(entry.lock().unwrap().reconnect_count(), MAX_RECONNECT_COUNT);
        assert_eq!(entry.lock().unwrap().state(), ConnectionState::Connected);
        drop(entry);

        // the budget is spent: the next transport failure is terminal
        let err = pool.call(PORT, b"ping").unwrap_err();
        assert!(matches!(err, ClientError::Exhausted { .. }));
        assert!(err.to_string().contains("max number of attempts reached"));
        assert!(!pool.contains(PORT));
    }

    #[test]
    fn connection_left_reconnecting_is_replaced() {
        let connector = ScriptedConnector::with([MockStream::broken()]);
        let pool = ConnectionPool::with_connector(connector.clone());
        let entry = pool.get(PORT).unwrap();

        connector.panic_on_next_dial();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| pool.call(PORT, b"ping")));
        assert!(outcome.is_err());

        let state = match entry.lock() {
            Ok(connection) => connection.state(),
            Err(poisoned) => poisoned.into_inner().state(),
        };
        assert_eq!(state, ConnectionState::Reconnecting);

        connector.push([MockStream::replying(&["pong"])]);
        assert_eq!(pool.call(PORT, b"ping").unwrap(), b"pong");
        assert!(!Arc::ptr_eq(&entry, &pool.get(PORT).unwrap()));
        assert_eq!(connector.dials(), 3);
    }

    #[test]
    fn exhausted_connection_is_evicted() {
        let connector = ScriptedConnector::with((0..4).map(|_| MockStream::broken()));
        let pool = ConnectionPool::with_connector(connector.clone());

        let err = pool.call(PORT, b"ping").unwrap_err();
        assert!(matches!(err, ClientError::Exhausted { .. }));
        assert_eq!(connector.dials(), 4);
        assert!(pool.is_empty());

        // the next call starts over with a brand new connection
        connector.push([MockStream::replying(&["back"])]);
        assert_eq!(pool.call(PORT, b"ping").unwrap(), b"back");
        let entry = pool.get(PORT).unwrap();
        assert_eq!(entry.lock().unwrap().reconnect_count(), 0);
    }

    #[test]
    fn read_failure_triggers_reconnect() {
        // accepts the write, then reports end of stream
        let silent = MockStream::replying(&[]);
        let connector = ScriptedConnector::with([silent, MockStream::replying(&["ok"])]);
        let pool = ConnectionPool::with_connector(connector.clone());

        assert_eq!(pool.call(PORT, b"req").unwrap(), b"ok");
        assert_eq!(connector.dials(), 2);
    }

    #[test]
    fn dial_failure_is_not_cached() {
        let connector = ScriptedConnector::default();
        let pool = ConnectionPool::with_connector(connector.clone());

        let err = pool.call(PORT, b"ping").unwrap_err();
        assert!(matches!(err, ClientError::Dial { .. }));
        assert!(!pool.contains(PORT));

        connector.push([MockStream::replying(&["pong"])]);
        assert_eq!(pool.call(PORT, b"ping").unwrap(), b"pong");
        assert_eq!(connector.dials(), 2);
    }

    #[test]
    fn failed_reconnect_evicts() {
        let connector = ScriptedConnector::with([MockStream::broken()]);
        let pool = ConnectionPool::with_connector(connector.clone());

        let err = pool.call(PORT, b"ping").unwrap_err();
        assert!(matches!(err, ClientError::Reconnect { .. }));
        assert!(err.is_terminal());
        assert!(!pool.contains(PORT));
    }

    #[test]
    fn malformed_response_is_not_retried() {
        let connector = ScriptedConnector::with([MockStream::raw(b"garbage")]);
        let pool = ConnectionPool::with_connector(connector.clone());

        let err = pool.call(PORT, b"ping").unwrap_err();
        assert!(matches!(err, ClientError::Frame(FrameError::Malformed { .. })));
        assert_eq!(connector.dials(), 1);
        assert!(pool.contains(PORT));
    }

    #[test]
    fn request_with_delimiter_is_rejected() {
        let connector = ScriptedConnector::with([MockStream::broken()]);
        let pool = ConnectionPool::with_connector(connector.clone());

        let err = pool.call(PORT, b"a\r\nb").unwrap_err();
        assert!(matches!(err, ClientError::Frame(FrameError::EmbeddedDelimiter)));
        // rejected before touching the socket, so no reconnect happened
        assert_eq!(connector.dials(), 1);
    }

    #[test]
    fn concurrent_get_dials_once() {
        let connector = ScriptedConnector::with([MockStream::replying(&[])]);
        let pool = Arc::new(ConnectionPool::with_connector(connector.clone()));

        let getters: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.get(PORT).unwrap())
            })
            .collect();
        let entries: Vec<_> = getters.into_iter().map(|g| g.join().unwrap()).collect();

        assert!(Arc::ptr_eq(&entries[0], &entries[1]));
        assert_eq!(connector.dials(), 1);
    }

    #[test]
    fn explicit_evict_closes_connection() {
        let connector = ScriptedConnector::with([MockStream::replying(&[])]);
        let pool = ConnectionPool::with_connector(connector);

        let entry = pool.get(PORT).unwrap();
        assert!(pool.evict(PORT));
        assert!(!pool.evict(PORT));
        assert_eq!(entry.lock().unwrap().state(), ConnectionState::Closed);
    }

    fn start(
        port: u16,
        reply: &'static str,
    ) -> (SocketAddr, ShutdownHandle, thread::JoinHandle<Result<(), ServerError>>) {
        let server = Server::bind(ServerConfig::new("127.0.0.1", port), move |_: &[u8]| {
            reply.as_bytes().to_vec()
        })
        .unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        (addr, shutdown, thread::spawn(move || server.serve()))
    }

    #[test]
    fn ping_pong_over_tcp() {
        let (addr, shutdown, server) = start(0, "pong");
        let pool = ConnectionPool::new();

        assert_eq!(pool.call(addr.port(), b"ping").unwrap(), b"pong");
        assert_eq!(pool.call(addr.port(), b"ping").unwrap(), b"pong");
        assert_eq!(send_request("127.0.0.1", addr.port(), b"ping").unwrap(), b"pong");

        shutdown.shutdown();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn survives_server_restart() {
        let (addr, shutdown, server) = start(0, "first");
        let port = addr.port();
        let pool = ConnectionPool::new();

        assert_eq!(pool.call(port, b"ping").unwrap(), b"first");

        shutdown.shutdown();
        server.join().unwrap().unwrap();

        let (_, shutdown, server) = start(port, "second");
        assert_eq!(pool.call(port, b"ping").unwrap(), b"second");
        let entry = pool.get(port).unwrap();
        assert_eq!(entry.lock().unwrap().reconnect_count(), 1);
        drop(entry);

        shutdown.shutdown();
        server.join().unwrap().unwrap();

        // nobody listening anymore: the re-dial fails and the entry goes away
        let err = pool.call(port, b"ping").unwrap_err();
        assert!(err.is_terminal());
        assert!(!pool.contains(port));
    }

    #[test]
    fn one_shot_dial_failure() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let err = send_request("127.0.0.1", port, b"ping").unwrap_err();
        assert!(matches!(err, ClientError::Dial { .. }));
    }
}
