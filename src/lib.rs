//! ensemble
//!
//! A self-organizing peer group for a local network. Every node runs both a
//! WebSocket listener and a WebSocket client; the nodes elect exactly one
//! coordinator among themselves, keep a gossiped registry of every peer they
//! have seen, and distribute a monotone, drift-corrected shared clock from
//! the coordinator to its followers.
//!
//! This crate provides:
//! - The framed message codec ([`Chunk`], [`Stream`]) carrying control and
//!   application traffic
//! - The peer registry with source tagging and staleness pruning
//!   ([`PeerRegistry`])
//! - The election state machine and discovery driver ([`NetworkPeer`])
//! - The sample-driven precision clock ([`PrecisionTimer`])
//! - Pluggable transport and discovery layers, with a blocking WebSocket
//!   transport ([`transport::ws`]), an in-process transport
//!   ([`transport::memory`]) and a DNS-SD driver ([`MdnsDiscovery`])

pub mod client;
pub mod codec;
pub mod discovery;
mod error;
pub mod peer;
pub mod peers;
pub mod precision;
pub mod server;
pub mod timing;
pub mod transport;

mod lock;

pub use codec::{Chunk, CodecError, Stream};
pub use discovery::{BrowseHit, Discovery, MdnsDiscovery};
pub use error::Error;
pub use peer::{ClientState, LanPeer, NetworkPeer, PeerConfig, PeerDelegate};
pub use peers::{Host, Peer, PeerRegistry, PeerSource};
pub use precision::{LanPrecisionTimer, MedianFilter, PrecisionTimer};
pub use timing::{CpuTimer, IntervalPoll, TimeStamp};
pub use transport::ConnectionId;

/// First item of every control message.
pub const CONNECTION_TAG: &str = "~";

/// First item of every application message.
pub const DATA_TAG: &str = "-";

/// Default listener and advertisement port.
pub const DEFAULT_PORT: u16 = 8001;

/// Default DNS-SD registration name (advertised as `_ensemble._tcp.`).
pub const DEFAULT_SERVICE: &str = "ensemble";

/// WebSocket endpoint path used by both roles.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Default sampling rate of the precision clock, in hertz.
pub const DEFAULT_SAMPLING_RATE: f64 = 44100.0;
