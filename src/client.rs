//! The client facet: the single outgoing connection a peer holds toward
//! its coordinator.

use std::sync::Weak;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::lock::VariableLock;
use crate::peers::Host;
use crate::transport::{ClientDelegate, ClientTransport};

struct Slot<C> {
    connection: Option<C>,
    /// The host we are connected to; empty while disconnected.
    upstream: Host,
}

/// Owns the outgoing transport handle and remembers the upstream host for
/// status reports, the server peer-entry refresh and `Switch` payloads.
pub struct ClientFacet<C> {
    slot: RwLock<Slot<C>>,
}

impl<C: ClientTransport> ClientFacet<C> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Slot {
                connection: None,
                upstream: Host::default(),
            }),
        }
    }

    /// Connect to a host, replacing (and closing) any previous connection.
    /// Returns whether a connection is held afterwards.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        path: &str,
        delegate: Weak<dyn ClientDelegate>,
    ) -> bool {
        debug!(host, port, "client facet: connection attempt");
        let connection = C::connect(host, port, path, delegate);
        let connected = connection.is_some();

        let mut lock = VariableLock::exclusive(&self.slot);
        let released = lock.get_mut().connection.take();
        lock.get_mut().connection = connection;
        lock.get_mut().upstream = if connected {
            info!(host, port, "client facet: connected");
            Host::new(host, port)
        } else {
            debug!(host, port, "client facet: connection failed");
            Host::default()
        };
        lock.destroy();
        drop(released);

        connected
    }

    /// Best-effort send; a no-op while disconnected.
    pub fn send(&self, data: &[u8]) {
        if let Some(connection) = &self.slot.read().connection {
            connection.send(data);
        }
    }

    /// Socket liveness. The protocol-level "connected as client" predicate
    /// additionally requires the `Connected` client state.
    pub fn is_connected(&self) -> bool {
        self.slot.read().connection.is_some()
    }

    pub fn upstream(&self) -> Host {
        self.slot.read().upstream.clone()
    }

    /// Drop the connection deliberately (failed negotiation, teardown).
    pub fn disconnect(&self) {
        let mut lock = VariableLock::exclusive(&self.slot);
        let released = lock.get_mut().connection.take();
        lock.get_mut().upstream = Host::default();
        lock.destroy();
        if released.is_some() {
            info!("client facet: disconnected");
        }
        drop(released);
    }

    /// Transport close callback. Idempotent: the first close clears the
    /// slot, later ones are no-ops.
    pub fn handle_close(&self) -> bool {
        let mut lock = VariableLock::shared(&self.slot);
        if lock.get().connection.is_some() {
            lock.promote();
            let released = lock.get_mut().connection.take();
            lock.get_mut().upstream = Host::default();
            lock.demote();
            drop(released);
            info!("client facet: connection closed");
            true
        } else {
            false
        }
    }
}

impl<C: ClientTransport> Default for ClientFacet<C> {
    fn default() -> Self {
        Self::new()
    }
}
