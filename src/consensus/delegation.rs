//! Delegate-and-wait
//!
//! A node that may not produce blocks itself sends its payload to a group of
//! producers and waits for one of them to report the committed block. Each
//! request is keyed by its message timestamp, which the producer also uses as
//! the block time, so racing producers build the same block and only one can
//! land.

use crate::blockchain::Block;
use crate::network::{GossipMessage, Relay};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct Pending {
    reply: oneshot::Sender<Block>,
    sent_on_validation: bool,
}

pub struct Delegation {
    name: &'static str,
    timeout: Duration,
    pending: Mutex<HashMap<i64, Pending>>,
}

/// Removes the pending entry when the waiting side goes away.
struct PendingGuard<'a> {
    delegation: &'a Delegation,
    timestamp: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.delegation.pending.lock().remove(&self.timestamp);
    }
}

impl Delegation {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Delegation {
            name,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a request under a free timestamp, bumping it until unique.
    fn open(&self, mut message: GossipMessage) -> (GossipMessage, oneshot::Receiver<Block>) {
        let (reply, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        while pending.contains_key(&message.timestamp) {
            message.timestamp += 1;
        }
        pending.insert(
            message.timestamp,
            Pending {
                reply,
                sent_on_validation: false,
            },
        );
        (message, rx)
    }

    /// Sends `data` as `id` to `group` and waits for the committed block.
    /// Resolves exactly once: with the block, or with `None` on timeout.
    pub async fn delegate(&self, relay: &Relay, id: &str, data: Value, group: &str) -> Option<Block> {
        let (message, rx) = self.open(relay.create_message(data, group, id));
        let _guard = PendingGuard {
            delegation: self,
            timestamp: message.timestamp,
        };
        info!("{}: Sending block addition request", self.name);
        relay.send_message(&message).await;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(block)) => {
                debug!("{}: Request {} answered with block {}", self.name, message.timestamp, block.index);
                Some(block)
            }
            _ => {
                warn!("{}: No producer answered request {} in time", self.name, message.timestamp);
                None
            }
        }
    }

    /// Hands `block` to the request opened at `timestamp`.
    pub fn resolve(&self, timestamp: i64, block: Block) -> bool {
        match self.pending.lock().remove(&timestamp) {
            Some(pending) => pending.reply.send(block).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, timestamp: i64) -> bool {
        self.pending.lock().contains_key(&timestamp)
    }

    /// Flags the request as handed to a producer. False when there is no such
    /// request or it was already handed out.
    pub fn mark_sent_on_validation(&self, timestamp: i64) -> bool {
        match self.pending.lock().get_mut(&timestamp) {
            Some(pending) if !pending.sent_on_validation => {
                pending.sent_on_validation = true;
                true
            }
            _ => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LocalMesh, RelayConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn lone_relay() -> Relay {
        let mesh = LocalMesh::new();
        let (peers, _inbox) = mesh.join("a");
        Relay::new(RelayConfig::new("a"), peers)
    }

    #[tokio::test]
    async fn test_timeout_resolves_none_and_clears_entry() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let relay = lone_relay();
            let delegation = Delegation::new("Test", Duration::from_millis(50));
            assert!(delegation.delegate(&relay, "Ask", json!({}), "group").await.is_none());
            assert_eq!(delegation.pending_len(), 0);
        })
        .await
        .expect("test_timeout_resolves_none_and_clears_entry timed out");
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter_once() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let relay = Arc::new(lone_relay());
            let delegation = Arc::new(Delegation::new("Test", Duration::from_secs(3)));

            let waiter = {
                let (relay, delegation) = (Arc::clone(&relay), Arc::clone(&delegation));
                tokio::spawn(async move { delegation.delegate(&relay, "Ask", json!({}), "group").await })
            };
            while delegation.pending_len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let timestamp = *delegation.pending.lock().keys().next().unwrap();

            assert!(delegation.mark_sent_on_validation(timestamp));
            assert!(!delegation.mark_sent_on_validation(timestamp));

            let block = Block::genesis(1_700_000_000_000);
            assert!(delegation.resolve(timestamp, block.clone()));
            assert!(!delegation.resolve(timestamp, block.clone()));
            assert_eq!(waiter.await.unwrap(), Some(block));
            assert_eq!(delegation.pending_len(), 0);
        })
        .await
        .expect("test_resolve_wakes_waiter_once timed out");
    }

    #[test]
    fn test_colliding_timestamps_are_bumped() {
        let delegation = Delegation::new("Test", Duration::from_secs(1));
        let first = GossipMessage::new(json!(1), "g", "a", "Ask").with_timestamp(1_000);
        let second = first.clone();
        let (first, _rx1) = delegation.open(first);
        let (second, _rx2) = delegation.open(second);
        assert_eq!(first.timestamp, 1_000);
        assert_eq!(second.timestamp, 1_001);
        assert_eq!(delegation.pending_len(), 2);
    }
}
