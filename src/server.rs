//! The server facet: the listener handle a peer runs while it is (or may
//! yet become) the coordinator.

use std::sync::Weak;

use parking_lot::RwLock;
use tracing::info;

use crate::lock::VariableLock;
use crate::transport::{ConnectionId, ServerDelegate, ServerTransport};

/// Owns the listening transport handle. Starts and stops are serialised by
/// promoting the facet lock to exclusive around handle mutation; sends and
/// counts run under the shared side.
pub struct ServerFacet<S> {
    slot: RwLock<Option<S>>,
}

impl<S: ServerTransport> ServerFacet<S> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Start the listener if it is not running.
    pub fn start(&self, port: u16, path: &str, delegate: Weak<dyn ServerDelegate>) {
        let mut lock = VariableLock::shared(&self.slot);
        if lock.get().is_none() {
            let server = S::bind(port, path, delegate);
            lock.promote();
            *lock.get_mut() = server;
        } else {
            info!(port, "server facet: already running");
        }
    }

    /// Stop the listener and drop every connection with it.
    pub fn stop(&self) {
        let mut lock = VariableLock::shared(&self.slot);
        if lock.get().is_some() {
            lock.promote();
            let released = lock.get_mut().take();
            lock.destroy();
            drop(released);
            info!("server facet: stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Open sockets, regardless of confirmation state.
    pub fn client_count(&self) -> usize {
        self.slot
            .read()
            .as_ref()
            .map(S::connection_count)
            .unwrap_or(0)
    }

    /// Best-effort send to one client. False when the listener is down or
    /// the id is unknown.
    pub fn send_to(&self, id: ConnectionId, data: &[u8]) -> bool {
        match &*self.slot.read() {
            Some(server) => server.send(id, data),
            None => false,
        }
    }

    /// Best-effort send to every client. False when the listener is down.
    pub fn broadcast(&self, data: &[u8]) -> bool {
        match &*self.slot.read() {
            Some(server) => {
                server.broadcast(data);
                true
            }
            None => false,
        }
    }
}

impl<S: ServerTransport> Default for ServerFacet<S> {
    fn default() -> Self {
        Self::new()
    }
}
