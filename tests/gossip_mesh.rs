//! Multi-node relay behaviour over an in-process mesh.

use async_trait::async_trait;
use proptest::prelude::*;
use relaychain::network::relay::SendOutcome;
use relaychain::network::{GossipMessage, HandlerOutcome, LocalMesh, MessageHandler, Relay, RelayConfig, Route};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Counter {
    hits: AtomicUsize,
}

impl Counter {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Counter {
    async fn handle(&self, _relay: &Relay, _message: &GossipMessage) -> HandlerOutcome {
        self.hits.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::Consumed
    }
}

struct Net {
    mesh: Arc<LocalMesh>,
    relays: Vec<Arc<Relay>>,
    pumps: Vec<JoinHandle<()>>,
}

impl Net {
    fn new(addresses: &[&str], links: &[(&str, &str)]) -> Self {
        let mesh = LocalMesh::new();
        let mut relays = Vec::new();
        let mut pumps = Vec::new();
        for address in addresses {
            let (peers, inbox) = mesh.join(address);
            let relay = Arc::new(Relay::new(RelayConfig::new(address), peers));
            pumps.push(Arc::clone(&relay).spawn_pump(inbox));
            relays.push(relay);
        }
        for (a, b) in links {
            mesh.connect(a, b);
        }
        Net { mesh, relays, pumps }
    }

    fn relay(&self, address: &str) -> &Arc<Relay> {
        self.relays
            .iter()
            .find(|r| r.address() == address)
            .expect("unknown relay")
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

async fn wait_for(counter: &Counter, hits: usize) {
    while counter.hits() < hits {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_line_delivery_and_routed_reply() {
    tokio::time::timeout(Duration::from_secs(5), async {
        let net = Net::new(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c"), ("c", "d")]);
        let at_d = Arc::new(Counter::default());
        let at_a = Arc::new(Counter::default());
        net.relay("d").register_handler("Ping", at_d.clone());
        net.relay("a").register_handler("Pong", at_a.clone());

        let ping = net.relay("a").create_message(json!({"n": 1}), "d", "Ping");
        assert_eq!(net.relay("a").send_message(&ping).await, SendOutcome::Broadcast(1));
        wait_for(&at_d, 1).await;

        let back = net.relay("d").cached_route("a").expect("route back to a");
        assert_eq!(back.hops(), &["d", "c", "b", "a"]);

        let pong = net.relay("d").create_message(json!({"n": 2}), "a", "Pong");
        assert_eq!(net.relay("d").send_message(&pong).await, SendOutcome::Routed);
        wait_for(&at_a, 1).await;
        assert_eq!(net.relay("b").stats().sent_broadcast, 1);
        assert_eq!(net.relay("b").stats().sent_direct, 1);
    })
    .await
    .expect("test_line_delivery_and_routed_reply timed out");
}

#[tokio::test]
async fn test_diamond_delivers_once() {
    tokio::time::timeout(Duration::from_secs(5), async {
        let net = Net::new(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let at_d = Arc::new(Counter::default());
        net.relay("d").register_handler("Ping", at_d.clone());

        let ping = net.relay("a").create_message(json!("x"), "d", "Ping");
        assert_eq!(net.relay("a").send_message(&ping).await, SendOutcome::Broadcast(2));
        wait_for(&at_d, 1).await;
        while net.relay("d").stats().dropped_duplicate < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(at_d.hits(), 1);
    })
    .await
    .expect("test_diamond_delivers_once timed out");
}

#[tokio::test]
async fn test_group_members_deliver_and_keep_flooding() {
    tokio::time::timeout(Duration::from_secs(5), async {
        let net = Net::new(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let at_b = Arc::new(Counter::default());
        let at_c = Arc::new(Counter::default());
        for (address, counter) in [("b", &at_b), ("c", &at_c)] {
            net.relay(address).join_group("validators");
            net.relay(address).register_handler("Hello", counter.clone());
        }

        let hello = net.relay("a").create_message(json!(null), "validators", "Hello");
        net.relay("a").send_message(&hello).await;
        wait_for(&at_b, 1).await;
        wait_for(&at_c, 1).await;
        assert!(net.mesh.linked("a", "b"));
    })
    .await
    .expect("test_group_members_deliver_and_keep_flooding timed out");
}

#[tokio::test]
async fn test_request_response_over_two_hops() {
    tokio::time::timeout(Duration::from_secs(5), async {
        struct Echo;

        #[async_trait]
        impl MessageHandler for Echo {
            async fn handle(&self, relay: &Relay, message: &GossipMessage) -> HandlerOutcome {
                relay.respond(message, json!({"echo": message.data})).await;
                HandlerOutcome::Consumed
            }
        }

        let net = Net::new(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        net.relay("c").register_handler("Echo", Arc::new(Echo));

        let response = net
            .relay("a")
            .request("Echo", json!(7), "c", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.sender, "c");
        assert_eq!(response.data, json!({"echo": 7}));
    })
    .await
    .expect("test_request_response_over_two_hops timed out");
}

/// Routes that pass through "x"; complete ones end at the receiver "z".
fn route_through_x() -> impl Strategy<Value = (Vec<String>, bool)> {
    (
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "x"]), 0..7),
        any::<prop::sample::Index>(),
        any::<bool>(),
    )
        .prop_map(|(hops, at, complete)| {
            let mut hops: Vec<String> = hops.into_iter().map(str::to_string).collect();
            let at = at.index(hops.len() + 1);
            hops.insert(at, "x".to_string());
            if complete {
                hops.push("z".to_string());
            }
            (hops, complete)
        })
}

proptest! {
    #[test]
    fn prop_relay_never_forwards_a_route_it_is_on((hops, complete) in route_through_x()) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let mesh = LocalMesh::new();
            let (peers, _inbox) = mesh.join("x");
            let (_y, mut y_inbox) = mesh.join("y");
            let (_z, mut z_inbox) = mesh.join("z");
            mesh.connect("x", "y");
            mesh.connect("x", "z");
            let relay = Relay::new(RelayConfig::new("x"), peers);

            let route = Route::from_hops(hops.clone());
            prop_assert!(!relay.may_forward(&route));

            let mut message = GossipMessage::new(json!(1), "z", "s", "Ping").with_route(route.clone());
            if complete {
                // a complete route also travels as the planned path
                message = message.with_path(route);
            }
            relay.handle_incoming(message, Some("y")).await;
            prop_assert!(y_inbox.try_recv().is_err());
            prop_assert!(z_inbox.try_recv().is_err());
            prop_assert_eq!(relay.stats().sent_direct + relay.stats().sent_broadcast, 0);
            Ok::<(), proptest::test_runner::TestCaseError>(())
        })?;
    }
}
