//! The carrier-facing socket contract.
//!
//! Sockets are created and destroyed by the socket carrier, never by the
//! multiplexer. The multiplexer holds a [`SocketHandle`] for writing and
//! for requesting shutdown; after a shutdown request the carrier eventually
//! notices the closed transport and calls `remove_socket`, at which point
//! the handle is dropped. Reads never go through the handle: the carrier
//! delivers readability events and the session pulls from its own input
//! stream.

use std::net::IpAddr;

use thiserror::Error;
use uuid::Uuid;

/// Identifies one transport connection for the lifetime of the process.
pub type SocketId = Uuid;

/// Error type for socket write operations.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer has closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

/// A borrowed view of one carrier-owned transport.
///
/// Writes must not block: implementations either buffer or fail. `shutdown`
/// is a request; the carrier remains responsible for tearing the transport
/// down and reporting the closure.
pub trait SocketHandle: Send {
    fn id(&self) -> SocketId;

    /// The peer's bare address, used for blacklisting.
    fn peer_address(&self) -> IpAddr;

    /// Human-readable peer endpoint (`address:port`) for logging.
    fn peer_endpoint(&self) -> String;

    /// Whether connections on this socket must go through the connection
    /// query even when queries are globally disabled (reverse connections,
    /// typically).
    fn requires_query(&self) -> bool {
        false
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SocketError>;

    fn flush(&mut self) -> Result<(), SocketError>;

    /// Requests an orderly shutdown of the transport.
    fn shutdown(&mut self);
}
