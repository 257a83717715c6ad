use std::{
    collections::HashMap,
    io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;

use super::{
    AdmissionGate, ProtocolTransport, frame,
    gate::DEFAULT_CAPACITY,
    transport::MAX_LINE_LENGTH,
};

/// Keep-alive period applied to every accepted socket.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to start listening on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("unable to accept connection: {0}")]
    Accept(io::Error),
    #[error("max_handlers must be at least 1")]
    NoHandlerSlots,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Number of connection handlers allowed to run at once.
    pub max_handlers: usize,
    pub keepalive: Duration,
    /// Longest request line accepted before the connection is dropped.
    pub max_line: usize,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_handlers: DEFAULT_CAPACITY,
            keepalive: KEEPALIVE_PERIOD,
            max_line: MAX_LINE_LENGTH,
        }
    }
}

/// Maps a request body to a response body.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

impl<F> RequestHandler for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    gate: AdmissionGate,
    shutdown: ShutdownHandle,
}

impl Server {
    pub fn bind<H: RequestHandler>(config: ServerConfig, handler: H) -> Result<Self, ServerError> {
        if config.max_handlers == 0 {
            error!("refusing to start a listener with no handler slots");
            return Err(ServerError::NoHandlerSlots);
        }

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).map_err(|source| {
            error!("unable to start listening, error: {source}");
            ServerError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;

        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            gate: AdmissionGate::new(config.max_handlers),
            handler: Arc::new(handler),
            shutdown: ShutdownHandle::new(local_addr),
            listener,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shutdown.inner.addr
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the accept loop until shutdown or the first accept error.
    ///
    /// Accepting is never throttled. Each connection gets its own thread,
    /// which waits on the admission gate before serving any request.
    pub fn serve(self) -> Result<(), ServerError> {
        info!("start listening tcp on {}", self.local_addr());

        for stream in self.listener.incoming() {
            if self.shutdown.is_shutdown() {
                debug!("listener on {} stopped", self.local_addr());
                return Ok(());
            }

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("unable to accept request, error: {e}");
                    return Err(ServerError::Accept(e));
                }
            };

            if let Err(e) = configure_keepalive(&stream, self.config.keepalive) {
                warn!("unable to enable keep-alive: {e}");
            }

            let id = match self.shutdown.track(&stream) {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!("listener on {} stopped", self.local_addr());
                    return Ok(());
                }
                Err(e) => {
                    warn!("dropping connection, unable to register it: {e}");
                    continue;
                }
            };

            let connection = Connection {
                id,
                transport: ProtocolTransport::with_max_line(stream, self.config.max_line),
                started: Instant::now(),
            };
            let handler = Arc::clone(&self.handler);
            let gate = self.gate.clone();
            let shutdown = self.shutdown.clone();

            thread::spawn(move || {
                let _permit = gate.acquire();
                let _registration = Registration { id, shutdown };
                connection.run(handler.as_ref());
            });
        }
        Ok(())
    }
}

/// Bind `host:port` and serve `handler` until the listener fails.
///
/// Bind failures are logged and returned so the calling process can carry on.
pub fn listen<H: RequestHandler>(host: &str, port: u16, handler: H) -> Result<(), ServerError> {
    Server::bind(ServerConfig::new(host, port), handler)?.serve()
}

fn configure_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let keepalive = keepalive.with_interval(period);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// One accepted socket and its request loop.
struct Connection {
    id: u64,
    transport: ProtocolTransport<TcpStream>,
    started: Instant,
}

impl Connection {
    fn run(mut self, handler: &dyn RequestHandler) {
        debug!("connection {} admitted", self.id);

        loop {
            let request = match self.transport.read_request() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    debug!("connection {} read failed: {e}", self.id);
                    break;
                }
            };

            info!(
                "connection open for {:?}, received message: {}",
                self.started.elapsed(),
                String::from_utf8_lossy(&request)
            );

            let response = handler.handle(&request);
            if frame::contains_delimiter(&response) {
                warn!("response body contains CRLF; clients will only see its first line");
            }
            info!(
                "answering request with: {}",
                String::from_utf8_lossy(&response)
            );

            if let Err(e) = self.transport.write_response(&response) {
                debug!("connection {} write failed: {e}", self.id);
                break;
            }
        }

        debug!("connection {} closed", self.id);
    }
}

/// Stops a running [`Server`] and severs its live connections.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    addr: SocketAddr,
    stopped: AtomicBool,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, TcpStream>>,
}

impl ShutdownHandle {
    fn new(addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                addr,
                stopped: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down listener on {}", self.inner.addr);

        // wake the blocking accept so the loop observes the flag
        let mut wake = self.inner.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake {
                SocketAddr::V4(_) => [127, 0, 0, 1].into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        if let Err(e) = TcpStream::connect(wake) {
            debug!("listener wake-up failed: {e}");
        }

        for (_, stream) in self.live().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn live_connections(&self) -> usize {
        self.live().len()
    }

    /// Register an accepted stream so [`shutdown`](Self::shutdown) can sever it.
    ///
    /// Returns `None` and closes the stream once shutdown has started. The
    /// flag is checked under the `live` lock, so a stream is either drained
    /// by `shutdown` or refused here.
    fn track(&self, stream: &TcpStream) -> io::Result<Option<u64>> {
        let clone = stream.try_clone()?;
        let mut live = self.live();
        if self.is_shutdown() {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(None);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        live.insert(id, clone);
        Ok(Some(id))
    }

    fn live(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        match self.inner.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Removes a connection from the live set when its thread ends.
struct Registration {
    id: u64,
    shutdown: ShutdownHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shutdown.live().remove(&self.id);
    }
}
