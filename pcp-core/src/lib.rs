// pcp-core - PeerCast protocol (PCP) relay engine
//
// Layout (leaf first):
// - atom/      - recursive TLV codec used by every PCP message
// - channel/   - content buffer, peer graph, broadcast routing, channel aggregate
// - session/   - source (upstream) and output (downstream) state machines, ping/pong
// - registry   - protocol factories keyed by name / URI scheme
// - peercast   - application root handed to every component (no global state)
// - server     - TCP listener that sniffs request headers and dispatches them

pub mod access;
pub mod atom;
pub mod channel;
pub mod net;
pub mod peercast;
pub mod registry;
pub mod server;
pub mod session;
pub mod settings;
pub mod utils;

pub use atom::{Atom, AtomName};
pub use channel::{Channel, ChannelStatus};
pub use peercast::PeerCast;
pub use server::RelayServer;
pub use settings::RelaySettings;
pub use utils::{BroadcastId, ChannelId, Guid, SessionId};

/// Agent string sent in HELO/OLEH and HTTP headers.
pub const AGENT: &str = concat!("pcp-relay/", env!("CARGO_PKG_VERSION"));
