//! The peer aggregate: election state machine and discovery driver.
//!
//! Every node runs two independent roles. The server role listens and
//! accepts followers; the client role holds at most one outgoing
//! connection toward a coordinator. A periodic host-driven tick
//! ([`NetworkPeer::discover`]) starts the listener and the advertisement,
//! connects to discovered peers, negotiates admission, performs handoffs
//! and ages the registry. Frames arriving on either role pass through one
//! shared tag dispatcher; application payloads are forwarded to the
//! registered [`PeerDelegate`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::chunk;
use crate::client::ClientFacet;
use crate::codec::{Chunk, CodecError, Stream};
use crate::discovery::{Discovery, MdnsDiscovery};
use crate::error::Error;
use crate::peers::{ConfirmedClients, Host, NextServer, Peer, PeerRegistry, PeerSource};
use crate::server::ServerFacet;
use crate::timing::CpuTimer;
use crate::transport::{
    ClientDelegate, ClientTransport, ConnectionId, ServerDelegate, ServerTransport, WsClient,
    WsServer,
};
use crate::{CONNECTION_TAG, DATA_TAG, DEFAULT_PORT, DEFAULT_SERVICE, DEFAULT_WS_PATH};

/// Drain window before a conceding coordinator tears its listener down, so
/// in-flight `Switch` messages reach the current followers.
const HANDOFF_DRAIN: Duration = Duration::from_millis(500);

/// The advertisement is forcibly restarted after this long, forcing an
/// eventual browse refresh.
const ADVERT_RESTART_SECS: f64 = 15.0;

/// Progress of this node's client role through the admission handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// Outgoing connection made, negotiation outcome pending.
    Unconfirmed = 0,
    /// The coordinator accepted us; the handoff runs on the next tick.
    Confirmed = 1,
    /// The coordinator rejected us; the next tick disconnects.
    Failed = 2,
    /// A settled follower. Terminal until the socket closes.
    Connected = 3,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ClientState::Unconfirmed as u8))
    }

    fn load(&self) -> ClientState {
        match self.0.load(Ordering::SeqCst) {
            0 => ClientState::Unconfirmed,
            1 => ClientState::Confirmed,
            2 => ClientState::Failed,
            _ => ClientState::Connected,
        }
    }

    fn store(&self, state: ClientState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// The admission predicate. A coordinator holding `local_count` confirmed
/// followers accepts a candidate holding `remote_count`, with a strict
/// lexicographic tie-break so two equal candidates never both win.
pub(crate) fn negotiate_accepts(
    local_count: i32,
    remote_count: i32,
    local_name: &str,
    remote_name: &str,
) -> bool {
    let prefer_self = remote_count == local_count && local_name < remote_name;
    remote_count < local_count || prefer_self
}

/// Receives application payloads (everything under the `"-"` tag) from
/// both roles. The stream cursor sits just past the tag.
pub trait PeerDelegate: Send + Sync {
    fn receive_as_server(&self, _id: ConnectionId, _stream: &mut Stream<'_>) {}
    fn receive_as_client(&self, _stream: &mut Stream<'_>) {}
}

/// Construction parameters. No environment variables, no persisted state.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// DNS-SD registration name, advertised as `_<service>._tcp.`.
    pub service: String,
    /// Preferred listener and advertisement port.
    pub port: u16,
    /// WebSocket endpoint path.
    pub path: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.into(),
            port: DEFAULT_PORT,
            path: DEFAULT_WS_PATH.into(),
        }
    }
}

struct PeerShared<S, C, D> {
    config: PeerConfig,
    discovery: D,
    host_name: String,
    server: ServerFacet<S>,
    client: ClientFacet<C>,
    state: StateCell,
    confirmed: ConfirmedClients,
    peers: PeerRegistry,
    next_server: NextServer,
    advert_restart: Mutex<CpuTimer>,
    delegate: RwLock<Option<Weak<dyn PeerDelegate>>>,
}

/// A self-organizing peer. Generic over the server transport, client
/// transport and discovery driver; [`LanPeer`] is the production stack.
pub struct NetworkPeer<S: ServerTransport, C: ClientTransport, D: Discovery> {
    shared: Arc<PeerShared<S, C, D>>,
}

/// The production peer: WebSocket transports and mDNS discovery.
pub type LanPeer = NetworkPeer<WsServer, WsClient, MdnsDiscovery>;

impl LanPeer {
    /// Build a peer on the production stack.
    pub fn open(config: PeerConfig) -> Result<Self, Error> {
        let discovery = MdnsDiscovery::new(&config.service, config.port)?;
        Ok(Self::new(config, discovery))
    }
}

impl<S, C, D> NetworkPeer<S, C, D>
where
    S: ServerTransport,
    C: ClientTransport,
    D: Discovery,
{
    /// Build a peer around an externally constructed discovery driver.
    /// Nothing runs until the first [`discover`](Self::discover) tick.
    pub fn new(config: PeerConfig, discovery: D) -> Self {
        let host_name = discovery.host_name();
        Self {
            shared: Arc::new(PeerShared {
                config,
                discovery,
                host_name,
                server: ServerFacet::new(),
                client: ClientFacet::new(),
                state: StateCell::new(),
                confirmed: ConfirmedClients::new(),
                peers: PeerRegistry::new(),
                next_server: NextServer::new(),
                advert_restart: Mutex::new(CpuTimer::new()),
                delegate: RwLock::new(None),
            }),
        }
    }

    /// Register the handler for application payloads. The peer keeps only
    /// a weak handle; drop the delegate and the callbacks stop.
    pub fn set_delegate(&self, delegate: Weak<dyn PeerDelegate>) {
        *self.shared.delegate.write() = Some(delegate);
    }

    /// The periodic driver tick. `interval_ms` must be the host's actual
    /// tick period, because it is also how much every registry entry ages.
    /// Entries reaching `max_peer_time_ms` are pruned.
    pub fn discover(&self, interval_ms: u32, max_peer_time_ms: u32) {
        self.shared.discover(interval_ms, max_peer_time_ms);
    }

    /// This node's conformed FQDN.
    pub fn host_name(&self) -> &str {
        &self.shared.host_name
    }

    /// Protocol-level follower predicate: an outgoing connection exists
    /// and the handshake has settled.
    pub fn is_client_connected(&self) -> bool {
        self.shared.is_client_connected()
    }

    /// Coordinator predicate: at least one follower has confirmed. This is
    /// not listener liveness; see [`is_server_running`](Self::is_server_running).
    pub fn is_server_connected(&self) -> bool {
        self.shared.is_server_connected()
    }

    /// Whether the listener is up, confirmed followers or not.
    pub fn is_server_running(&self) -> bool {
        self.shared.server.is_running()
    }

    /// Neither a settled follower nor a confirmed coordinator.
    pub fn is_disconnected(&self) -> bool {
        !self.is_client_connected() && !self.is_server_connected()
    }

    pub fn client_state(&self) -> ClientState {
        self.shared.state.load()
    }

    /// Followers that completed the handshake.
    pub fn confirmed_count(&self) -> usize {
        self.shared.confirmed.len()
    }

    /// Open sockets on the listener, confirmed or not.
    pub fn client_count(&self) -> usize {
        self.shared.server.client_count()
    }

    /// Ordered copy of the peer registry.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.peers.snapshot()
    }

    /// Human-readable connection status: the coordinator name with its
    /// follower counts, the upstream name for a follower, or
    /// `Disconnected`.
    pub fn server_report(&self) -> String {
        let shared = &self.shared;
        if shared.is_server_connected() {
            let confirmed = shared.confirmed.len();
            let sockets = shared.server.client_count();
            let mut report = shared.host_name.clone();
            if confirmed != sockets {
                report.push_str(&format!(" [{confirmed}][{sockets}]"));
            } else {
                report.push_str(&format!(" [{confirmed}]"));
            }
            if shared.client.is_connected() {
                report.push_str(&format!(" [{}]", shared.client.upstream().name));
            }
            report
        } else if shared.client.is_connected() {
            shared.client.upstream().name
        } else {
            "Disconnected".into()
        }
    }

    /// One line per registry entry: `name [Source] time`.
    pub fn peer_report(&self) -> String {
        let mut report = String::new();
        for peer in self.shared.peers.snapshot() {
            report.push_str(&format!(
                "{} [{}] {}\n",
                peer.name(),
                peer.source.label(),
                peer.time
            ));
        }
        report
    }

    /// Broadcast an application payload to every follower.
    pub fn send_from_server(&self, payload: &Chunk) -> bool {
        self.shared.server.broadcast(tagged(DATA_TAG, payload).as_bytes())
    }

    /// Send an application payload to one follower.
    pub fn send_to_client(&self, id: ConnectionId, payload: &Chunk) -> bool {
        self.shared.server.send_to(id, tagged(DATA_TAG, payload).as_bytes())
    }

    /// Send an application payload to the coordinator.
    pub fn send_from_client(&self, payload: &Chunk) {
        self.shared.client.send(tagged(DATA_TAG, payload).as_bytes());
    }
}

impl<S: ServerTransport, C: ClientTransport, D: Discovery> Drop for NetworkPeer<S, C, D> {
    fn drop(&mut self) {
        // Advertisement first, then the listener.
        self.shared.discovery.stop();
        self.shared.server.stop();
    }
}

fn tagged(tag: &str, payload: &Chunk) -> Chunk {
    let mut message = Chunk::new();
    message.put_str(tag).put_chunk(payload);
    message
}

impl<S, C, D> PeerShared<S, C, D>
where
    S: ServerTransport,
    C: ClientTransport,
    D: Discovery,
{
    fn is_client_connected(&self) -> bool {
        self.client.is_connected() && self.state.load() == ClientState::Connected
    }

    fn is_server_connected(&self) -> bool {
        !self.confirmed.is_empty()
    }

    fn is_self(&self, name: &str) -> bool {
        name == self.host_name
    }

    fn discover(self: &Arc<Self>, interval_ms: u32, max_peer_time_ms: u32) {
        // A live outgoing connection that has not failed: finish a pending
        // handoff, refresh the upstream registry entry, and we are done.
        if self.client.is_connected() && self.state.load() != ClientState::Failed {
            if self.state.load() == ClientState::Confirmed {
                self.client_connection_confirmed();
            }
            let upstream = self.client.upstream();
            if !upstream.is_empty() {
                self.peers
                    .add(Peer::new(upstream.name, upstream.port, PeerSource::Server));
            }
            self.peers.prune(max_peer_time_ms, interval_ms);
            return;
        }

        // A failed negotiation: drop the socket and carry on below.
        if self.client.is_connected() && self.state.load() == ClientState::Failed {
            info!("negotiation failed; dropping outgoing connection");
            self.client.disconnect();
        }

        // An authoritative redirect (handoff or lost negotiation) takes
        // precedence over everything else while its window lasts.
        let next = self.next_server.get();
        if !next.is_empty() {
            self.try_connect(&next.name, next.port, true);
            self.peers.prune(max_peer_time_ms, interval_ms);
            return;
        }

        if !self.server.is_running() {
            let delegate_arc: Arc<dyn ServerDelegate> = self.clone();
            let delegate: Weak<dyn ServerDelegate> = Arc::downgrade(&delegate_arc);
            self.server
                .start(self.discovery.port(), &self.config.path, delegate);
        }

        if !self.discovery.is_running() {
            self.discovery.start();
            self.advert_restart.lock().start();
        }

        for hit in self.discovery.browse() {
            let unresolved = hit.is_unresolved();
            let mut name = if unresolved { hit.name } else { hit.host };
            if unresolved {
                // An unresolved browse name like `studio-local` is the
                // conformed form of `studio.local.`; guess the FQDN so the
                // entry can match later resolutions.
                if let Some(stripped) = name.strip_suffix("-local") {
                    name = format!("{stripped}.local.");
                }
            }
            let source = if unresolved {
                PeerSource::Unresolved
            } else {
                PeerSource::Discovered
            };
            self.peers.add(Peer::new(name, hit.port, source));
        }

        // Walk the ordered registry and become a client of the first
        // plausible coordinator.
        for peer in self.peers.snapshot() {
            if peer.is_client() || peer.is_unresolved() || self.is_self(peer.name()) {
                continue;
            }
            if self.try_connect(peer.name(), peer.port(), false) {
                break;
            }
            self.discovery.resolve(peer.name());
        }

        if self.advert_restart.lock().interval() > ADVERT_RESTART_SECS {
            self.discovery.stop();
        }

        if self.is_server_connected() {
            self.send_peer_list();
            self.ping_clients();
        }

        self.peers.prune(max_peer_time_ms, interval_ms);
    }

    fn try_connect(self: &Arc<Self>, host: &str, port: u16, direct: bool) -> bool {
        let delegate_arc: Arc<dyn ClientDelegate> = self.clone();
        let delegate: Weak<dyn ClientDelegate> = Arc::downgrade(&delegate_arc);
        if !self.client.connect(host, port, &self.config.path, delegate) {
            return false;
        }

        if direct {
            // The redirect was authoritative; skip negotiation.
            self.client_connection_confirmed();
        } else {
            self.state.store(ClientState::Unconfirmed);
            let count = self.confirmed.len() as i32;
            self.client.send(
                chunk![
                    CONNECTION_TAG,
                    "Negotiate",
                    self.host_name,
                    self.discovery.port(),
                    count
                ]
                .as_bytes(),
            );
        }
        true
    }

    /// The handoff: acknowledge the new coordinator, redirect our own
    /// followers to it, then retire the server role.
    fn client_connection_confirmed(&self) {
        let upstream = self.client.upstream();
        info!(server = %upstream.name, "joining as follower");

        self.client
            .send(chunk![CONNECTION_TAG, "Confirm"].as_bytes());
        self.server.broadcast(
            chunk![CONNECTION_TAG, "Switch", upstream.name, upstream.port].as_bytes(),
        );

        self.state.store(ClientState::Connected);

        // Let the Switch frames drain before the listener goes away.
        thread::sleep(HANDOFF_DRAIN);
        self.discovery.stop();
        self.server.stop();
        self.confirmed.clear();
    }

    fn send_peer_list(&self) {
        let mut peers = self.peers.snapshot();
        peers.retain(|peer| !peer.is_unresolved());
        if peers.is_empty() {
            return;
        }

        let mut entries = Chunk::new();
        for peer in &peers {
            entries.put_str(peer.name()).put(peer.port()).put(peer.time);
        }
        self.server.broadcast(
            chunk![CONNECTION_TAG, "Peers", peers.len() as i32, entries].as_bytes(),
        );
    }

    fn ping_clients(&self) {
        self.server
            .broadcast(chunk![CONNECTION_TAG, "Ping"].as_bytes());
    }

    fn set_next_server(&self, name: &str, port: u16) {
        // Never redirect to ourselves.
        if !self.is_self(name) {
            self.next_server.set(Host::new(name, port));
        }
    }

    fn delegate(&self) -> Option<Arc<dyn PeerDelegate>> {
        self.delegate.read().as_ref().and_then(Weak::upgrade)
    }

    fn handle_control_to_server(&self, id: ConnectionId, stream: &mut Stream<'_>) {
        if stream.is_next_tag("Negotiate") {
            let parsed = (|| -> Result<(String, u16, i32), CodecError> {
                let name = stream.get_str()?.to_string();
                let port = stream.get::<u16>()?;
                let count = stream.get::<i32>()?;
                Ok((name, port, count))
            })();
            let Ok((client_name, client_port, remote_count)) = parsed else {
                warn!(id, "undecodable Negotiate; dropping");
                return;
            };

            let local_count = self.confirmed.len() as i32;
            let confirm =
                negotiate_accepts(local_count, remote_count, &self.host_name, &client_name);
            debug!(
                id,
                %client_name,
                local_count,
                remote_count,
                confirm,
                "negotiation decided"
            );
            self.server.send_to(
                id,
                chunk![CONNECTION_TAG, "Confirm", confirm as i32].as_bytes(),
            );

            if !confirm {
                info!(new_server = %client_name, "conceding coordination");
                self.set_next_server(&client_name, client_port);
            }
        } else if stream.is_next_tag("Ping") {
            let parsed = (|| -> Result<(String, u16), CodecError> {
                let name = stream.get_str()?.to_string();
                let port = stream.get::<u16>()?;
                Ok((name, port))
            })();
            let Ok((name, port)) = parsed else {
                warn!(id, "undecodable Ping; dropping");
                return;
            };
            self.peers.add(Peer::new(name, port, PeerSource::Client));
        } else if stream.is_next_tag("Confirm") {
            info!(id, "follower confirmed");
            self.confirmed.add(id);
        } else if let Ok(tag) = stream.get_str() {
            warn!(id, tag, "unknown control sub-tag; dropping");
        } else {
            warn!(id, "unreadable control message; dropping");
        }
    }

    fn handle_control_to_client(&self, stream: &mut Stream<'_>) {
        if stream.is_next_tag("Confirm") {
            match stream.get::<i32>() {
                Ok(confirm) if confirm != 0 => {
                    info!("admission confirmed");
                    self.state.store(ClientState::Confirmed);
                }
                Ok(_) => {
                    info!("admission rejected");
                    self.state.store(ClientState::Failed);
                }
                Err(_) => warn!("undecodable Confirm; dropping"),
            }
        } else if stream.is_next_tag("Switch") {
            let parsed = (|| -> Result<(String, u16), CodecError> {
                let name = stream.get_str()?.to_string();
                let port = stream.get::<u16>()?;
                Ok((name, port))
            })();
            let Ok((name, port)) = parsed else {
                warn!("undecodable Switch; dropping");
                return;
            };
            info!(new_server = %name, "switch requested");
            self.set_next_server(&name, port);
        } else if stream.is_next_tag("Ping") {
            self.client.send(
                chunk![
                    CONNECTION_TAG,
                    "Ping",
                    self.host_name,
                    self.discovery.port()
                ]
                .as_bytes(),
            );
        } else if stream.is_next_tag("Peers") {
            let Ok(count) = stream.get::<i32>() else {
                warn!("undecodable Peers count; dropping");
                return;
            };
            for _ in 0..count {
                let parsed = (|| -> Result<(String, u16, u32), CodecError> {
                    let name = stream.get_str()?.to_string();
                    let port = stream.get::<u16>()?;
                    let time = stream.get::<u32>()?;
                    Ok((name, port, time))
                })();
                let Ok((name, port, time)) = parsed else {
                    warn!("truncated Peers list; dropping remainder");
                    return;
                };
                self.peers
                    .add(Peer::with_time(name, port, PeerSource::Remote, time));
            }
        } else if let Ok(tag) = stream.get_str() {
            warn!(tag, "unknown control sub-tag; dropping");
        } else {
            warn!("unreadable control message; dropping");
        }
    }
}

impl<S, C, D> ServerDelegate for PeerShared<S, C, D>
where
    S: ServerTransport,
    C: ClientTransport,
    D: Discovery,
{
    fn on_ready(&self, id: ConnectionId) {
        debug!(id, "inbound connection ready");
    }

    fn on_data(&self, id: ConnectionId, data: &[u8]) {
        let mut stream = Stream::new(data);
        if stream.is_next_tag(CONNECTION_TAG) {
            self.handle_control_to_server(id, &mut stream);
        } else if stream.is_next_tag(DATA_TAG) {
            if let Some(delegate) = self.delegate() {
                delegate.receive_as_server(id, &mut stream);
            }
        } else {
            warn!(id, "unknown frame tag; dropping message");
        }
    }

    fn on_close(&self, id: ConnectionId) {
        // No reconnection from this side; the client rediscovers or was
        // switched away.
        self.confirmed.remove(id);
        debug!(id, "inbound connection closed");
    }
}

impl<S, C, D> ClientDelegate for PeerShared<S, C, D>
where
    S: ServerTransport,
    C: ClientTransport,
    D: Discovery,
{
    fn on_data(&self, data: &[u8]) {
        let mut stream = Stream::new(data);
        if stream.is_next_tag(CONNECTION_TAG) {
            self.handle_control_to_client(&mut stream);
        } else if stream.is_next_tag(DATA_TAG) {
            if let Some(delegate) = self.delegate() {
                delegate.receive_as_client(&mut stream);
            }
        } else {
            warn!("unknown frame tag; dropping message");
        }
    }

    fn on_close(&self) {
        self.client.handle_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_counts_dominate() {
        // More followers wins regardless of names.
        assert!(negotiate_accepts(2, 0, "zeta", "alpha"));
        assert!(!negotiate_accepts(0, 2, "alpha", "zeta"));
    }

    #[test]
    fn negotiation_tie_break_is_antisymmetric() {
        let names = ["alpha.local.", "beta.local.", "gamma.local."];
        for a in names {
            for b in names {
                if a == b {
                    continue;
                }
                let a_accepts = negotiate_accepts(1, 1, a, b);
                let b_accepts = negotiate_accepts(1, 1, b, a);
                // Exactly one side prefers itself.
                assert_ne!(a_accepts, b_accepts, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), ClientState::Unconfirmed);
        for state in [
            ClientState::Confirmed,
            ClientState::Failed,
            ClientState::Connected,
            ClientState::Unconfirmed,
        ] {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn config_defaults() {
        let config = PeerConfig::default();
        assert_eq!(config.service, DEFAULT_SERVICE);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.path, DEFAULT_WS_PATH);
    }
}
