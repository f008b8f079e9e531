//! Shared fixtures for the multi-node integration tests.

#![allow(dead_code)]

use relaychain::blockchain::{now_millis, Block, Blockchain, ChainState};
use relaychain::consensus::{ConsensusEngine, EngineConfig};
use relaychain::crypto::NodeIdentity;
use relaychain::dispatch::BlockDispatcher;
use relaychain::keyring::KeyringFile;
use relaychain::network::{LocalMesh, Relay, RelayConfig};
use relaychain::persistence::InMemoryPersistence;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub struct TestNode {
    pub identity: Arc<NodeIdentity>,
    pub relay: Arc<Relay>,
    pub engine: Arc<ConsensusEngine>,
    pub pump: JoinHandle<()>,
    _work_dir: TempDir,
}

impl TestNode {
    pub fn address(&self) -> String {
        self.identity.public_key_hex()
    }

    pub fn height(&self) -> i64 {
        self.engine.chain().height()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Genesis shared by every node of one test network.
pub fn genesis(age_ms: i64) -> Block {
    Block::genesis(now_millis() - age_ms)
}

/// A node on `mesh` whose bus address is its public key. Validators are
/// registered by the caller.
pub fn spawn_node(
    mesh: &Arc<LocalMesh>,
    identity: Arc<NodeIdentity>,
    genesis: &Block,
    keyring: &[String],
    active: &str,
) -> TestNode {
    let address = identity.public_key_hex();
    let work_dir = TempDir::new().unwrap();

    let file = KeyringFile::in_dir(work_dir.path());
    if !keyring.is_empty() {
        file.save(keyring).unwrap();
    }

    let store = Arc::new(InMemoryPersistence::new());
    let chain = Arc::new(Blockchain::open(store, Arc::new(ChainState::new())).unwrap());
    chain.ensure_genesis(genesis.clone()).unwrap();

    let (peers, inbox) = mesh.join(&address);
    let relay = Arc::new(Relay::new(RelayConfig::new(&address), peers));
    let pump = Arc::clone(&relay).spawn_pump(inbox);

    let dispatcher = Arc::new(BlockDispatcher::new(address, Some(file), false));
    let engine = ConsensusEngine::new(
        chain,
        dispatcher,
        Arc::clone(&relay),
        Arc::clone(&identity),
        EngineConfig {
            active: active.to_string(),
            ..EngineConfig::default()
        },
    );

    TestNode {
        identity,
        relay,
        engine,
        pump,
        _work_dir: work_dir,
    }
}
