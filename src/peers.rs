//! The peer registry and the small shared-state holders that back the
//! election: the confirmed-client set and the next-server slot.

use std::cell::RefCell;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};

use crate::transport::ConnectionId;

/// How long a `Switch` or lost negotiation stays actionable.
const NEXT_SERVER_WINDOW: Duration = Duration::from_secs(4);

/// A hostname and port. An empty name denotes "no host".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// How a registry entry was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerSource {
    /// Browse result whose address has not been resolved yet.
    Unresolved,
    /// Browse result with a resolved host.
    Discovered,
    /// The peer connected to us as a client and pinged its identity.
    Client,
    /// We are currently connected to it as a client.
    Server,
    /// Learned transitively from another peer's gossiped list.
    Remote,
}

impl PeerSource {
    pub fn label(self) -> &'static str {
        match self {
            PeerSource::Unresolved => "Unresolved",
            PeerSource::Discovered => "Discovered",
            PeerSource::Client => "Client",
            PeerSource::Server => "Server",
            PeerSource::Remote => "Remote",
        }
    }
}

/// A known peer with its linger counter: milliseconds since the last
/// refresh, aged by the discovery tick and pruned at a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub host: Host,
    pub source: PeerSource,
    pub time: u32,
}

impl Peer {
    pub fn new(name: impl Into<String>, port: u16, source: PeerSource) -> Self {
        Self::with_time(name, port, source, 0)
    }

    pub fn with_time(name: impl Into<String>, port: u16, source: PeerSource, time: u32) -> Self {
        Self {
            host: Host::new(name, port),
            source,
            time,
        }
    }

    pub fn name(&self) -> &str {
        &self.host.name
    }

    pub fn port(&self) -> u16 {
        self.host.port
    }

    pub fn is_client(&self) -> bool {
        self.source == PeerSource::Client
    }

    pub fn is_unresolved(&self) -> bool {
        self.source == PeerSource::Unresolved
    }
}

/// Ordered set of known peers, keyed by name in ascending lexicographic
/// order.
///
/// Guarded by a reentrant mutex: callbacks fired under a registry operation
/// may land back in the registry without deadlocking.
#[derive(Default)]
pub struct PeerRegistry {
    inner: ReentrantMutex<RefCell<Vec<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer at its ordered position, or refresh the existing entry
    /// with the same name: port and source are overwritten, the linger time
    /// keeps whichever is fresher (smaller).
    pub fn add(&self, peer: Peer) {
        let guard = self.inner.lock();
        let mut list = guard.borrow_mut();
        match list.binary_search_by(|p| p.name().cmp(peer.name())) {
            Ok(found) => {
                let existing = &mut list[found];
                existing.host.port = peer.host.port;
                existing.source = peer.source;
                existing.time = existing.time.min(peer.time);
            }
            Err(slot) => list.insert(slot, peer),
        }
    }

    /// Age every entry by `add_time`, then drop entries whose linger time
    /// reached `max_time`. Ageing happens here and only here; there is no
    /// per-entry wall-clock timer.
    pub fn prune(&self, max_time: u32, add_time: u32) {
        let guard = self.inner.lock();
        let mut list = guard.borrow_mut();
        if add_time > 0 {
            for peer in list.iter_mut() {
                peer.time = peer.time.saturating_add(add_time);
            }
        }
        list.retain(|peer| peer.time < max_time);
    }

    /// Copy of the ordered sequence.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.inner.lock().borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a peer should connect next, written on `Switch` receipt or on a
/// lost negotiation. Reads return the empty host once the validity window
/// has passed, so a stale handoff cannot loop.
#[derive(Default)]
pub struct NextServer {
    slot: Mutex<Option<(Host, Instant)>>,
}

impl NextServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: Host) {
        *self.slot.lock() = Some((host, Instant::now()));
    }

    pub fn get(&self) -> Host {
        match &*self.slot.lock() {
            Some((host, set_at)) if set_at.elapsed() <= NEXT_SERVER_WINDOW => host.clone(),
            _ => Host::default(),
        }
    }
}

/// Connection ids whose client `Confirm` we have received while acting as
/// server. This set, not socket liveness, is what "connected as server"
/// means.
#[derive(Default)]
pub struct ConfirmedClients {
    ids: Mutex<HashSet<ConnectionId>>,
}

impl ConfirmedClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: ConnectionId) {
        self.ids.lock().insert(id);
    }

    pub fn remove(&self, id: ConnectionId) {
        self.ids.lock().remove(&id);
    }

    pub fn clear(&self) {
        self.ids.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}
