//! WebSocket peer directory
//!
//! Every connection starts with a `Hello` frame carrying the peer's bus
//! address. Only one socket per bus address is kept; a second one is closed
//! right after the handshake.

use super::mesh::{Inbound, PeerDirectory};
use super::message::GossipMessage;
use crate::error::ChainError;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

/// How long a new connection has to introduce itself.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
enum Frame {
    Hello {
        #[serde(rename = "busAddress")]
        bus_address: String,
    },
    Relay(GossipMessage),
}

pub struct WsPeers {
    address: String,
    peers: RwLock<HashMap<String, UnboundedSender<String>>>,
    inbound: UnboundedSender<Inbound>,
}

impl WsPeers {
    /// Creates the directory and the inbox the relay pump reads from.
    pub fn new(address: &str) -> (Arc<Self>, UnboundedReceiver<Inbound>) {
        let (inbound, inbox) = unbounded_channel();
        let peers = Arc::new(WsPeers {
            address: address.to_string(),
            peers: RwLock::new(HashMap::new()),
            inbound,
        });
        (peers, inbox)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Accepts peers on `bind`. Returns the accept loop and the bound address.
    pub async fn listen(self: &Arc<Self>, bind: &str) -> Result<(JoinHandle<()>, SocketAddr), ChainError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Failed to bind {}: {}", bind, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| ChainError::NetworkError(format!("No local address: {}", e)))?;
        info!("P2P server listening on ws://{}", local);

        let directory = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let directory = Arc::clone(&directory);
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => directory.run(ws).await,
                                Err(e) => warn!("WebSocket handshake with {} failed: {}", remote, e),
                            }
                        });
                    }
                    Err(e) => warn!("Accept error: {}", e),
                }
            }
        });
        Ok((handle, local))
    }

    /// Dials `url` (for example `ws://127.0.0.1:6015`). The connection runs in
    /// the background once the socket is open.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<(), ChainError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Failed to connect to {}: {}", url, e)))?;
        debug!("Connected to {}", url);
        tokio::spawn(Arc::clone(self).run(ws));
        Ok(())
    }

    /// Polls until at least `count` peers completed the handshake.
    pub async fn wait_for_peers(&self, count: usize, max_wait: Duration) -> bool {
        tokio::time::timeout(max_wait, async {
            while self.peer_count() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Keeps at most one socket per bus address.
    fn register(&self, bus_address: &str, outbox: UnboundedSender<String>) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(bus_address) {
            return false;
        }
        peers.insert(bus_address.to_string(), outbox);
        true
    }

    async fn run<S>(self: Arc<Self>, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        let hello = Frame::Hello {
            bus_address: self.address.clone(),
        };
        let Ok(hello) = serde_json::to_string(&hello) else {
            return;
        };
        if sink.send(Message::Text(hello)).await.is_err() {
            return;
        }

        let bus_address = match tokio::time::timeout(HELLO_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Hello { bus_address }) => bus_address,
                _ => {
                    warn!("Peer did not introduce itself, closing");
                    let _ = sink.close().await;
                    return;
                }
            },
            _ => {
                warn!("No hello from peer, closing");
                let _ = sink.close().await;
                return;
            }
        };

        if bus_address == self.address {
            warn!("Connected to ourselves, closing");
            let _ = sink.close().await;
            return;
        }

        let (outbox, mut outgoing) = unbounded_channel::<String>();
        if !self.register(&bus_address, outbox.clone()) {
            info!("Already connected to {}, closing duplicate socket", bus_address);
            let _ = sink.close().await;
            return;
        }
        info!("Peer {} connected", bus_address);

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                    Ok(Frame::Relay(message)) => {
                        let inbound = Inbound {
                            from: bus_address.clone(),
                            message,
                        };
                        if self.inbound.send(inbound).is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Hello { .. }) => {}
                    Err(e) => debug!("Bad frame from {}: {}", bus_address, e),
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("WebSocket error from {}: {}", bus_address, e);
                    break;
                }
                _ => {}
            }
        }

        {
            let mut peers = self.peers.write();
            if peers
                .get(&bus_address)
                .map(|tx| tx.same_channel(&outbox))
                .unwrap_or(false)
            {
                peers.remove(&bus_address);
            }
        }
        writer.abort();
        info!("Peer {} disconnected", bus_address);
    }

    fn encode(message: &GossipMessage) -> Option<String> {
        serde_json::to_string(&Frame::Relay(message.clone())).ok()
    }
}

impl PeerDirectory for WsPeers {
    fn send_to(&self, bus_address: &str, message: &GossipMessage) -> bool {
        let Some(text) = Self::encode(message) else {
            return false;
        };
        match self.peers.read().get(bus_address) {
            Some(outbox) => outbox.send(text).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, message: &GossipMessage, except: &[String]) -> usize {
        let Some(text) = Self::encode(message) else {
            return 0;
        };
        self.peers
            .read()
            .iter()
            .filter(|(address, _)| !except.contains(address))
            .filter(|(_, outbox)| outbox.send(text.clone()).is_ok())
            .count()
    }

    fn disconnect(&self, bus_address: &str) {
        // dropping the outbox ends the writer, which closes the socket
        self.peers.write().remove(bus_address);
    }

    fn peers(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }
}
