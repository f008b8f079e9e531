//! Relay: routing, dedup and local delivery of gossip messages
//!
//! Sending tries the directly connected peer first, then a cached route back
//! to the receiver, then floods every neighbour not already on the route.
//! Incoming messages pass four checks before anything else happens:
//! relay type, self loop, staleness and mutex dedup.

use super::mesh::{Inbound, PeerDirectory};
use super::message::*;
use super::mutex::MutexRegistry;
use super::route::Route;
use crate::blockchain::now_millis;
use crate::cache::RouteCache;
use crate::error::ChainError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Number of senders a relay remembers a route back to.
pub const ROUTE_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// This node's bus address.
    pub address: String,
    pub relevancy_time_ms: i64,
    pub latency_slack_ms: i64,
    pub mutex_window: Duration,
    pub max_route_len: usize,
}

impl RelayConfig {
    pub fn new(address: &str) -> Self {
        RelayConfig {
            address: address.to_string(),
            relevancy_time_ms: LATENCY_TIME_MS,
            latency_slack_ms: LATENCY_TIME_MS,
            mutex_window: Duration::from_millis(MESSAGE_MUTEX_TIMEOUT_MS),
            max_route_len: MAX_ROUTE_LEN,
        }
    }
}

/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Handled. No other handler sees the message.
    Consumed,
    /// Not for this handler, keep looking.
    NotMine,
    /// Handled, but other handlers on the same channel still get it.
    ConsumedKeepOpen,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, relay: &Relay, message: &GossipMessage) -> HandlerOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Loopback,
    Direct,
    /// Sent to the next hop of a cached route.
    Routed,
    Broadcast(usize),
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    Ignored,
    SelfLoop,
    Stale,
    Duplicate,
    Delivered { consumed: bool },
    Forwarded(SendOutcome),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub sent_direct: u64,
    pub sent_broadcast: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub dropped_stale: u64,
    pub dropped_duplicate: u64,
    pub dropped_loop: u64,
    pub dropped_self: u64,
}

#[derive(Default)]
struct Counters {
    sent_direct: AtomicU64,
    sent_broadcast: AtomicU64,
    delivered: AtomicU64,
    forwarded: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_loop: AtomicU64,
    dropped_self: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Clone)]
struct Registration {
    id: String,
    broadcast_id: String,
    handler: Arc<dyn MessageHandler>,
}

impl Registration {
    fn matches(&self, message: &GossipMessage) -> bool {
        if self.id == BROADCAST_ID {
            message.id == BROADCAST_ID && message.broadcast_id == self.broadcast_id
        } else {
            message.id == self.id
        }
    }
}

pub struct Relay {
    config: RelayConfig,
    peers: Arc<dyn PeerDirectory>,
    routes: RouteCache,
    mutexes: MutexRegistry,
    handlers: RwLock<Vec<Registration>>,
    groups: RwLock<HashSet<String>>,
    waiters: Mutex<HashMap<(String, String), oneshot::Sender<GossipMessage>>>,
    counters: Counters,
}

impl Relay {
    pub fn new(config: RelayConfig, peers: Arc<dyn PeerDirectory>) -> Self {
        let mutexes = MutexRegistry::new(config.mutex_window);
        Relay {
            config,
            peers,
            routes: RouteCache::new_lru(ROUTE_CACHE_SIZE),
            mutexes,
            handlers: RwLock::new(Vec::new()),
            groups: RwLock::new(HashSet::new()),
            waiters: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<dyn PeerDirectory> {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    /// Makes this relay an endpoint for a logical group address. Group
    /// messages are delivered locally and still flooded onward.
    pub fn join_group(&self, group: &str) {
        self.groups.write().insert(group.to_string());
    }

    pub fn leave_group(&self, group: &str) {
        self.groups.write().remove(group);
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.read().contains(group)
    }

    pub fn register_handler(&self, id: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(Registration {
            id: id.to_string(),
            broadcast_id: String::new(),
            handler,
        });
    }

    /// Registers on the shared broadcast channel for one `broadcastId`.
    pub fn register_broadcast_handler(&self, broadcast_id: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(Registration {
            id: BROADCAST_ID.to_string(),
            broadcast_id: broadcast_id.to_string(),
            handler,
        });
    }

    pub fn cached_route(&self, address: &str) -> Option<Route> {
        self.routes.peek(&address.to_string()).map(Route::from_hops)
    }

    pub fn stats(&self) -> RelayStats {
        let c = &self.counters;
        RelayStats {
            sent_direct: c.sent_direct.load(Ordering::Relaxed),
            sent_broadcast: c.sent_broadcast.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            dropped_stale: c.dropped_stale.load(Ordering::Relaxed),
            dropped_duplicate: c.dropped_duplicate.load(Ordering::Relaxed),
            dropped_loop: c.dropped_loop.load(Ordering::Relaxed),
            dropped_self: c.dropped_self.load(Ordering::Relaxed),
        }
    }

    /// New message from this node with the configured lifetime.
    pub fn create_message(&self, data: Value, receiver: &str, id: &str) -> GossipMessage {
        GossipMessage::new(data, receiver, self.address(), id)
            .with_relevancy_time(self.config.relevancy_time_ms)
    }

    /// Loop guard: a node never sends a copy whose route it is already on.
    pub fn may_forward(&self, route: &Route) -> bool {
        route.len() <= self.config.max_route_len && !route.contains(self.address())
    }

    /// Direct delivery to a connected peer, with this node appended to the route.
    pub async fn send_to_peer(&self, bus_address: &str, message: &GossipMessage) -> bool {
        if bus_address == self.address() {
            self.deliver_local(message).await;
            return true;
        }
        if !self.may_forward(&message.route) {
            debug!("Refusing to send {} to {}: route loop", message.id, bus_address);
            bump(&self.counters.dropped_loop);
            return false;
        }

        let outgoing = message.with_route(message.route.with_hop(self.address()));
        if !self.peers.send_to(bus_address, &outgoing) {
            return false;
        }
        self.mutexes.register(&message.mutex);
        bump(&self.counters.sent_direct);
        true
    }

    /// Floods to every neighbour that is not already on the route, which
    /// includes the previous hop. Any planned path is dropped.
    pub fn broadcast_message(&self, message: &GossipMessage) -> SendOutcome {
        if !self.may_forward(&message.route) {
            debug!("Refusing to broadcast {}: route loop", message.id);
            bump(&self.counters.dropped_loop);
            return SendOutcome::Refused;
        }
        let outgoing = message
            .with_route(message.route.with_hop(self.address()))
            .with_path(Route::new());
        let fanout = self.peers.broadcast(&outgoing, message.route.hops());
        self.mutexes.register(&message.mutex);
        bump(&self.counters.sent_broadcast);
        SendOutcome::Broadcast(fanout)
    }

    pub async fn send_message(&self, message: &GossipMessage) -> SendOutcome {
        if message.receiver == self.address() {
            self.deliver_local(message).await;
            return SendOutcome::Loopback;
        }
        if self.send_to_peer(&message.receiver, message).await {
            return SendOutcome::Direct;
        }
        if message.route.is_empty() {
            if let Some(planned) = self.cached_route(&message.receiver) {
                if let Some(next) = planned.next_after(self.address()) {
                    let next = next.to_string();
                    if self.send_to_peer(&next, &message.with_path(planned)).await {
                        return SendOutcome::Routed;
                    }
                }
            }
        }
        self.broadcast_message(message)
    }

    /// Forwards a message this node is not the endpoint of.
    async fn retranslate(&self, message: &GossipMessage) -> SendOutcome {
        bump(&self.counters.forwarded);
        if message.path.is_empty() {
            return self.send_message(message).await;
        }
        if let Some(next) = message.path.next_after(self.address()) {
            let next = next.to_string();
            if self.send_to_peer(&next, message).await {
                return SendOutcome::Routed;
            }
        }
        // planned path is broken; flood from here
        self.broadcast_message(message)
    }

    pub async fn handle_incoming(&self, message: GossipMessage, from: Option<&str>) -> IncomingOutcome {
        if message.kind != SW_BROADCAST {
            return IncomingOutcome::Ignored;
        }
        if message.sender == self.address() {
            if let Some(from) = from {
                warn!("Message {} came back from {}, closing the link", message.id, from);
                self.peers.disconnect(from);
            }
            bump(&self.counters.dropped_self);
            return IncomingOutcome::SelfLoop;
        }
        if message.is_stale(now_millis(), self.config.latency_slack_ms) {
            trace!("Dropping stale message {} from {}", message.id, message.sender);
            bump(&self.counters.dropped_stale);
            return IncomingOutcome::Stale;
        }
        if !self.mutexes.check_and_register(&message.mutex) {
            bump(&self.counters.dropped_duplicate);
            return IncomingOutcome::Duplicate;
        }

        if message.receiver == self.address() {
            if message.route.len() > 1 {
                let back = message.route.with_hop(self.address()).reversed_unique();
                self.routes.insert(message.sender.clone(), back.hops().to_vec());
            }
            let consumed = self.deliver_local(&message).await;
            return IncomingOutcome::Delivered { consumed };
        }

        if self.in_group(&message.receiver) {
            self.retranslate(&message).await;
            let consumed = self.deliver_local(&message).await;
            return IncomingOutcome::Delivered { consumed };
        }

        IncomingOutcome::Forwarded(self.retranslate(&message).await)
    }

    /// Runs the registered handlers. Returns whether any consumed the message.
    async fn deliver_local(&self, message: &GossipMessage) -> bool {
        bump(&self.counters.delivered);

        if message.is_response() && message.receiver == self.address() {
            let key = (message.id.clone(), message.broadcast_id.clone());
            let waiter = self.waiters.lock().remove(&key);
            if let Some(waiter) = waiter {
                let _ = waiter.send(message.clone());
                return true;
            }
        }

        let registrations = self.handlers.read().clone();
        let mut consumed = false;
        for registration in registrations.iter().filter(|r| r.matches(message)) {
            match registration.handler.handle(self, message).await {
                HandlerOutcome::Consumed => return true,
                HandlerOutcome::ConsumedKeepOpen => consumed = true,
                HandlerOutcome::NotMine => {}
            }
        }
        consumed
    }

    /// Sends `id` to `receiver` and waits for the matching `<id>_RESP`.
    pub async fn request(
        &self,
        id: &str,
        data: Value,
        receiver: &str,
        timeout: Duration,
    ) -> Result<GossipMessage, ChainError> {
        let message = self.create_message(data, receiver, id);
        let key = (GossipMessage::response_id(id), message.mutex.clone());
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(key.clone(), tx);

        self.send_message(&message).await;
        let result = tokio::time::timeout(timeout, rx).await;
        self.waiters.lock().remove(&key);

        match result {
            Ok(Ok(response)) => Ok(response),
            _ => Err(ChainError::NetworkError(format!(
                "No response to {} from {} within {:?}",
                id, receiver, timeout
            ))),
        }
    }

    /// Answers a request received through [`request`](Self::request).
    pub async fn respond(&self, request: &GossipMessage, data: Value) -> SendOutcome {
        let response = self
            .create_message(data, &request.sender, &GossipMessage::response_id(&request.id))
            .with_broadcast_id(&request.mutex);
        self.send_message(&response).await
    }

    /// Feeds inbound peer traffic into [`handle_incoming`](Self::handle_incoming).
    pub fn spawn_pump(self: Arc<Self>, mut inbox: UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                self.handle_incoming(inbound.message, Some(&inbound.from)).await;
            }
            debug!("Inbox of {} closed", self.address());
        })
    }
}
