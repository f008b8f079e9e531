use crate::blockchain::{Block, Blockchain, ChainState};
use crate::config::Config;
use crate::consensus::{
    lcpoa, pos, thrusted, ConsensusEngine, ContractQuery, LcpoaValidator, NoContracts,
    PosValidator, ThrustedValidator, WhitelistContract,
};
use crate::crypto::{scheme_by_name, NodeIdentity, DEFAULT_SCHEME};
use crate::dispatch::BlockDispatcher;
use crate::error::ChainError;
use crate::keyring::KeyringFile;
use crate::network::{Inbound, Relay, WsPeers};
use crate::persistence::{BlockStore, Database};
use crate::sync::{LedgerGuard, ResyncReport};
use crate::transactor::{AcceptedCallback, BlockGenerator, Transactor};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// File inside the work dir holding the node's secret key.
pub const NODE_KEY_FILE: &str = "node.key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
}

pub struct Node {
    config: Config,
    identity: Arc<NodeIdentity>,
    chain: Arc<Blockchain>,
    guard: LedgerGuard,
    peers: Arc<WsPeers>,
    inbox: Mutex<Option<UnboundedReceiver<Inbound>>>,
    relay: Arc<Relay>,
    engine: Arc<ConsensusEngine>,
    transactor: Arc<Transactor>,
    state: RwLock<NodeState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Opens storage and wires every component. Nothing runs until [`start`](Self::start).
    pub fn init(config: Config) -> Result<Arc<Self>, ChainError> {
        config.validate()?;
        info!(
            "Starting RelayChain node (consensus = {}, validators = {:?})",
            config.consensus.active, config.consensus.validators
        );

        let work_dir = config.work_dir();
        fs::create_dir_all(&work_dir)?;
        ensure_parent_dir(&config.database.path)?;

        let scheme = scheme_by_name(DEFAULT_SCHEME)?;
        let identity = Arc::new(NodeIdentity::load_or_generate(
            &work_dir.join(NODE_KEY_FILE),
            Arc::clone(&scheme),
        )?);
        let local_key = identity.public_key_hex();

        let store: Arc<dyn BlockStore> = Arc::new(Database::open(&config.database.path)?);
        let chain = Arc::new(Blockchain::open(store, Arc::new(ChainState::new()))?);
        chain.ensure_genesis(Block::genesis(config.ledger.genesis_timestamp))?;

        let dispatcher = Arc::new(
            BlockDispatcher::new(
                local_key.clone(),
                Some(KeyringFile::in_dir(&work_dir)),
                config.ledger.verbose,
            )
            .with_key_emission_max_block(config.consensus.key_emission_max_block),
        );
        let guard = LedgerGuard::new(Arc::clone(&chain), Arc::clone(&dispatcher), config.ledger.autofix);

        let address = config.bus_address_or(&local_key);
        let (peers, inbox) = WsPeers::new(&address);
        let relay = Arc::new(Relay::new(config.relay_config(&address), peers.clone()));

        let engine = ConsensusEngine::new(
            Arc::clone(&chain),
            dispatcher,
            Arc::clone(&relay),
            Arc::clone(&identity),
            config.engine_config(),
        );

        for name in &config.consensus.validators {
            match name.as_str() {
                lcpoa::CONSENSUS_NAME => {
                    engine.register_validator(LcpoaValidator::new(engine.context(), config.lcpoa_config()));
                }
                pos::CONSENSUS_NAME => {
                    let contracts: Arc<dyn ContractQuery> = if config.pos.whitelist.is_empty() {
                        Arc::new(NoContracts)
                    } else {
                        let mut contract = WhitelistContract::new(
                            &config.pos.master_contract,
                            config.pos.whitelist.clone(),
                            Arc::clone(&scheme),
                        );
                        if let Some(fee) = &config.pos.flat_fee {
                            contract = contract.with_flat_fee(fee);
                        }
                        Arc::new(contract)
                    };
                    engine.register_validator(PosValidator::new(engine.context(), config.pos_config(), contracts));
                }
                thrusted::CONSENSUS_NAME => {
                    engine.register_validator(ThrustedValidator::new(engine.context(), config.thrusted_config()));
                }
                other => {
                    return Err(ChainError::ConfigError(format!("Unknown validator '{}'", other)));
                }
            }
        }

        let transactor = Arc::new(Transactor::new(Arc::clone(&chain), config.transactor_config()));

        Ok(Arc::new(Node {
            config,
            identity,
            chain,
            guard,
            peers,
            inbox: Mutex::new(Some(inbox)),
            relay,
            engine,
            transactor,
            state: RwLock::new(NodeState::Booting),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub fn transactor(&self) -> &Arc<Transactor> {
        &self.transactor
    }

    /// Replays the ledger, then brings up the transport and the background
    /// loops. A corrupted ledger without autofix is returned as an error and
    /// leaves the node `Degraded`.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ChainError> {
        *self.state.write() = NodeState::Syncing;
        match self.guard.resync().await {
            Ok(ResyncReport::Truncated { divergence, height }) => {
                warn!("Ledger cut back at block {}, height is now {}", divergence, height);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Ledger replay failed: {}", e);
                *self.state.write() = NodeState::Degraded;
                return Err(e);
            }
        }

        let bind = format!("0.0.0.0:{}", self.config.network.p2p_port);
        let (accept_loop, local) = self.peers.listen(&bind).await?;

        let mut tasks = vec![accept_loop];
        if let Some(inbox) = self.inbox.lock().take() {
            tasks.push(Arc::clone(&self.relay).spawn_pump(inbox));
        }

        for peer in &self.config.network.bootstrap_peers {
            if let Err(e) = self.peers.connect(peer).await {
                warn!("Bootstrap peer {} unreachable: {}", peer, e);
            }
        }

        tasks.push(self.engine.spawn_empty_block_ticker());
        tasks.push(self.transactor.spawn_watch());
        self.tasks.lock().extend(tasks);

        *self.state.write() = NodeState::Ready;
        let (cached, capacity) = self.chain.cache_stats();
        debug!("Block cache holds {}/{} blocks", cached, capacity);
        info!(
            "Node {} ready at height {} on {}",
            self.relay.address(),
            self.chain.height(),
            local
        );
        Ok(local)
    }

    /// Produces a block for `payload` through the active validator and tracks
    /// it until it is confirmed.
    pub async fn submit(&self, payload: &str, on_accepted: Option<AcceptedCallback>) -> Result<u64, ChainError> {
        let generator: Arc<dyn BlockGenerator> = self.engine.clone();
        self.transactor.submit(payload, generator, on_accepted).await
    }

    /// Stops the background loops.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.state.write() = NodeState::Booting;
        info!("Node {} stopped", self.relay.address());
    }
}

fn ensure_parent_dir(db_path: &str) -> Result<(), ChainError> {
    if db_path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| ChainError::IoError(format!("Failed to create data dir {:?}: {}", parent, e)))?;
        }
    }
    Ok(())
}
