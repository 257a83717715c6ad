//! Request/response transport over raw TCP.
//!
//! This module holds both ends of the linewire protocol: a threaded server
//! that answers framed requests through a user handler, and a client that
//! keeps one persistent connection per destination port and heals broken
//! sockets on its own.
//!
//! # Overview
//!
//! Each request is a single text line and each response a small
//! memcache-style block (see [`frame`]). A connection carries one request at
//! a time; the next request is read only once the previous response has been
//! written.
//!
//! On the server, every accepted socket gets its own thread. Before serving
//! anything that thread takes a slot from the [`AdmissionGate`], so at most
//! `max_handlers` connections run their handler at once while the accept
//! loop itself keeps going.
//!
//! On the client, [`ConnectionPool::call`] resolves the pooled
//! [`ClientConnection`] for a port, dialing it on first use. Write and read
//! failures re-dial and resend up to [`MAX_RECONNECT_COUNT`] times, after
//! which the connection is evicted and the caller sees
//! [`ClientError::Exhausted`].
//!
//! # Limits
//!
//! - Bodies must not contain `\r\n`. The length field in responses is never
//!   used to delimit reads.
//! - There are no timeouts. A handler that never returns pins its
//!   connection thread and its gate slot, and a silent server blocks the
//!   client until the socket errors.
//!
//! # Key Components
//!
//! - [`Server`] / [`listen`]: accept loop and per-connection handler.
//! - [`ConnectionPool`]: client-side connection cache with reconnect-and-retry.
//! - [`ProtocolTransport`]: framed reads and writes over any `Read + Write`.
pub mod frame;

mod client;
mod gate;
mod server;
mod transport;

pub use client::{
    ClientConnection, ClientError, ConnectionPool, ConnectionState, Connector,
    MAX_RECONNECT_COUNT, PooledConnection, TcpConnector, send_request,
};
pub use frame::FrameError;
pub use gate::{AdmissionGate, DEFAULT_CAPACITY as DEFAULT_MAX_HANDLERS, Permit};
pub use server::{
    KEEPALIVE_PERIOD, RequestHandler, Server, ServerConfig, ServerError, ShutdownHandle, listen,
};
pub use transport::{MAX_LINE_LENGTH, ProtocolTransport, RESPONSE_BUFFER_SIZE, TransportError};
