//! Peer directory abstraction and an in-process mesh
//!
//! The relay only needs to know which bus addresses are directly connected and
//! how to push a message to them. [`LocalMesh`] wires relays together inside one
//! process, which is what the integration tests run on.

use super::message::GossipMessage;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// A message received from a directly connected peer.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: String,
    pub message: GossipMessage,
}

/// Address book of directly connected peers, keyed by bus address.
pub trait PeerDirectory: Send + Sync {
    /// Queues `message` for the peer registered under `bus_address`.
    /// Returns false when no such peer is connected.
    fn send_to(&self, bus_address: &str, message: &GossipMessage) -> bool;
    /// Queues `message` for every peer not listed in `except`. Returns the fan-out.
    fn broadcast(&self, message: &GossipMessage, except: &[String]) -> usize;
    fn disconnect(&self, bus_address: &str);
    fn peers(&self) -> Vec<String>;

    fn is_connected(&self, bus_address: &str) -> bool {
        self.peers().iter().any(|p| p == bus_address)
    }

    fn peer_count(&self) -> usize {
        self.peers().len()
    }
}

/// In-process switchboard. Links are undirected.
#[derive(Default)]
pub struct LocalMesh {
    inboxes: RwLock<HashMap<String, UnboundedSender<Inbound>>>,
    links: RwLock<HashSet<(String, String)>>,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalMesh::default())
    }

    /// Registers `address` and returns its directory plus its inbox.
    pub fn join(self: &Arc<Self>, address: &str) -> (Arc<LocalPeers>, UnboundedReceiver<Inbound>) {
        let (tx, rx) = unbounded_channel();
        self.inboxes.write().insert(address.to_string(), tx);
        let peers = Arc::new(LocalPeers {
            address: address.to_string(),
            mesh: Arc::clone(self),
        });
        (peers, rx)
    }

    pub fn connect(&self, a: &str, b: &str) {
        self.links.write().insert(link_key(a, b));
    }

    pub fn disconnect(&self, a: &str, b: &str) {
        self.links.write().remove(&link_key(a, b));
    }

    pub fn linked(&self, a: &str, b: &str) -> bool {
        self.links.read().contains(&link_key(a, b))
    }

    fn neighbours(&self, address: &str) -> Vec<String> {
        self.links
            .read()
            .iter()
            .filter_map(|(a, b)| {
                if a == address {
                    Some(b.clone())
                } else if b == address {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    fn deliver(&self, from: &str, to: &str, message: &GossipMessage) -> bool {
        match self.inboxes.read().get(to) {
            Some(inbox) => inbox
                .send(Inbound {
                    from: from.to_string(),
                    message: message.clone(),
                })
                .is_ok(),
            None => false,
        }
    }
}

/// One node's view of a [`LocalMesh`].
pub struct LocalPeers {
    address: String,
    mesh: Arc<LocalMesh>,
}

impl LocalPeers {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl PeerDirectory for LocalPeers {
    fn send_to(&self, bus_address: &str, message: &GossipMessage) -> bool {
        if !self.mesh.linked(&self.address, bus_address) {
            return false;
        }
        self.mesh.deliver(&self.address, bus_address, message)
    }

    fn broadcast(&self, message: &GossipMessage, except: &[String]) -> usize {
        self.mesh
            .neighbours(&self.address)
            .iter()
            .filter(|peer| !except.contains(peer))
            .filter(|peer| self.mesh.deliver(&self.address, peer, message))
            .count()
    }

    fn disconnect(&self, bus_address: &str) {
        debug!("{} dropping link to {}", self.address, bus_address);
        self.mesh.disconnect(&self.address, bus_address);
    }

    fn peers(&self) -> Vec<String> {
        self.mesh.neighbours(&self.address)
    }
}
