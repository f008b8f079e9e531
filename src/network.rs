//! Gossip relay layer
//!
//! Messages travel as [`GossipMessage`] envelopes over a [`PeerDirectory`].
//! The [`Relay`] decides per message whether to deliver it locally, forward it
//! along a known route or flood it to every neighbour.

pub mod mesh;
pub mod message;
pub mod mutex;
pub mod relay;
pub mod route;
pub mod transport;

pub use mesh::{Inbound, LocalMesh, LocalPeers, PeerDirectory};
pub use message::*;
pub use mutex::MutexRegistry;
pub use relay::{HandlerOutcome, IncomingOutcome, MessageHandler, Relay, RelayConfig, RelayStats};
pub use route::Route;
pub use transport::WsPeers;
