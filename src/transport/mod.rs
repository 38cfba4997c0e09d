//! The transport contract and its implementations.
//!
//! The core never touches sockets directly: the election machine and the
//! precision clock speak to a bidirectional, message-preserving byte
//! transport through the traits here. [`ws`] is the production WebSocket
//! implementation; [`memory`] routes connections inside one process and
//! backs the integration tests.
//!
//! Callbacks arrive on transport-owned threads, concurrently with the
//! discovery tick. Transports hold only a [`Weak`] delegate and check it on
//! every event, so a torn-down owner silently ends the callback stream
//! instead of keeping itself alive through its own transport.

use std::sync::Weak;

pub mod memory;
pub mod ws;

pub use memory::{MemoryClient, MemoryServer};
pub use ws::{WsClient, WsServer};

/// Identifies one accepted connection on a server for its lifetime.
pub type ConnectionId = usize;

/// Server-side transport events.
pub trait ServerDelegate: Send + Sync + 'static {
    /// A socket connected; the handshake may still be in flight.
    fn on_connect(&self, _id: ConnectionId) {}

    /// The connection is established and ready for frames.
    fn on_ready(&self, _id: ConnectionId) {}

    /// One complete inbound message.
    fn on_data(&self, id: ConnectionId, data: &[u8]);

    /// The connection is gone. Delivered at most once per id.
    fn on_close(&self, id: ConnectionId);
}

/// Client-side transport events.
pub trait ClientDelegate: Send + Sync + 'static {
    /// One complete inbound message.
    fn on_data(&self, data: &[u8]);

    /// The connection is gone. Delivered at most once.
    fn on_close(&self);
}

/// A listening endpoint accepting any number of inbound connections.
/// Dropping the handle closes the listener and every connection.
pub trait ServerTransport: Send + Sync + Sized + 'static {
    /// Bind and start accepting. Returns `None` when the port is taken.
    fn bind(port: u16, path: &str, delegate: Weak<dyn ServerDelegate>) -> Option<Self>;

    /// Best-effort send to one connection. A false return means the id is
    /// unknown; I/O failures surface later as `on_close`.
    fn send(&self, id: ConnectionId, data: &[u8]) -> bool;

    /// Best-effort send to every open connection.
    fn broadcast(&self, data: &[u8]);

    /// Number of currently open connections (socket liveness, not protocol
    /// confirmation).
    fn connection_count(&self) -> usize;

    /// Close the listener and all connections. Idempotent.
    fn close(&self);
}

/// One outgoing connection. Dropping the handle closes it.
pub trait ClientTransport: Send + Sync + Sized + 'static {
    /// Connect synchronously with a transport-level timeout. `None` on any
    /// failure: resolution, refusal, timeout or handshake.
    fn connect(host: &str, port: u16, path: &str, delegate: Weak<dyn ClientDelegate>)
        -> Option<Self>;

    /// Best-effort send; failures surface as `on_close`.
    fn send(&self, data: &[u8]);

    /// Close the connection. Idempotent.
    fn close(&self);
}
