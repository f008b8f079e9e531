//! Validator set and the block commit path
//!
//! All registered validators vote on every block. A block lands when at least
//! one accepts it and none vetoes it. Production goes through the configured
//! active validator, or the first ready one when the configured one is not
//! ready.

use super::{CancelToken, Validator, ValidatorContext, Verdict};
use crate::blockchain::{Block, Blockchain, Gate};
use crate::crypto::NodeIdentity;
use crate::dispatch::{BlockDispatcher, DispatchOutcome};
use crate::error::ChainError;
use crate::network::{GossipMessage, HandlerOutcome, MessageHandler, Relay};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Group every node joins to hear about new blocks.
pub const BLOCK_LISTENERS_GROUP: &str = "block_listeners";
/// Message id of a block announcement.
pub const LATEST_BLOCK_ID: &str = "LatestBlock";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the validator that produces blocks.
    pub active: String,
    pub gate_backoff: Duration,
    /// How long a commit waits for sync or chain response to finish.
    pub gate_max_wait: Duration,
    pub empty_block_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            active: super::thrusted::CONSENSUS_NAME.to_string(),
            gate_backoff: Duration::from_millis(100),
            gate_max_wait: Duration::from_secs(30),
            empty_block_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(DispatchOutcome),
    /// The same block is already on the chain.
    AlreadyKnown,
}

pub struct ConsensusEngine {
    chain: Arc<Blockchain>,
    dispatcher: Arc<BlockDispatcher>,
    relay: Arc<Relay>,
    identity: Arc<NodeIdentity>,
    config: EngineConfig,
    validators: RwLock<Vec<Arc<dyn Validator>>>,
    active: RwLock<String>,
    commit_lock: tokio::sync::Mutex<()>,
    self_ref: Weak<ConsensusEngine>,
}

struct AnnouncementHandler {
    engine: Weak<ConsensusEngine>,
}

#[async_trait]
impl MessageHandler for AnnouncementHandler {
    async fn handle(&self, _relay: &Relay, message: &GossipMessage) -> HandlerOutcome {
        let Some(engine) = self.engine.upgrade() else {
            return HandlerOutcome::NotMine;
        };
        let block = match message.data.get("block").cloned().map(serde_json::from_value::<Block>) {
            Some(Ok(block)) => block,
            _ => {
                debug!("Malformed block announcement from {}", message.sender);
                return HandlerOutcome::Consumed;
            }
        };
        if let Err(e) = engine.accept_announced(block).await {
            debug!("Announced block from {} rejected: {}", message.sender, e);
        }
        HandlerOutcome::Consumed
    }
}

impl ConsensusEngine {
    pub fn new(
        chain: Arc<Blockchain>,
        dispatcher: Arc<BlockDispatcher>,
        relay: Arc<Relay>,
        identity: Arc<NodeIdentity>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let active = config.active.clone();
        let engine = Arc::new_cyclic(|self_ref| ConsensusEngine {
            chain,
            dispatcher,
            relay,
            identity,
            config,
            validators: RwLock::new(Vec::new()),
            active: RwLock::new(active),
            commit_lock: tokio::sync::Mutex::new(()),
            self_ref: self_ref.clone(),
        });
        engine.relay.join_group(BLOCK_LISTENERS_GROUP);
        engine.relay.register_handler(
            LATEST_BLOCK_ID,
            Arc::new(AnnouncementHandler {
                engine: engine.self_ref.clone(),
            }),
        );
        engine
    }

    /// Handle given to validators built for this engine.
    pub fn context(&self) -> ValidatorContext {
        ValidatorContext {
            chain: Arc::clone(&self.chain),
            dispatcher: Arc::clone(&self.dispatcher),
            relay: Arc::clone(&self.relay),
            identity: Arc::clone(&self.identity),
            engine: self.self_ref.clone(),
        }
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_validator(&self, validator: Arc<dyn Validator>) {
        info!("{} validator loaded", validator.consensus_name());
        self.validators.write().push(validator);
    }

    pub fn validators(&self) -> Vec<Arc<dyn Validator>> {
        self.validators.read().clone()
    }

    pub fn validator(&self, name: &str) -> Option<Arc<dyn Validator>> {
        self.validators
            .read()
            .iter()
            .find(|v| v.consensus_name() == name)
            .cloned()
    }

    pub fn set_active(&self, name: &str) {
        *self.active.write() = name.to_string();
    }

    /// The configured validator when ready, else the first ready one.
    pub fn active_validator(&self) -> Option<Arc<dyn Validator>> {
        let validators = self.validators();
        let active = self.active.read().clone();
        if let Some(preferred) = validators.iter().find(|v| v.consensus_name() == active) {
            if preferred.is_ready() {
                return Some(Arc::clone(preferred));
            }
        }
        let fallback = validators.into_iter().find(|v| v.consensus_name() != active && v.is_ready());
        if let Some(v) = &fallback {
            debug!("{} not ready, producing with {}", active, v.consensus_name());
        }
        fallback
    }

    /// Turns idle block generation off everywhere but in `keep`.
    pub fn disable_empty_blocks_except(&self, keep: &str) {
        for validator in self.validators() {
            if validator.consensus_name() != keep && validator.generates_empty_blocks() {
                info!("{} empty block generation disabled", validator.consensus_name());
                validator.set_generate_empty_blocks(false);
            }
        }
    }

    pub async fn validate(&self, new: &Block, prev: &Block) -> Result<(), ChainError> {
        let mut accepted = false;
        let mut reasons = Vec::new();
        for validator in self.validators() {
            match validator.is_valid_new_block(new, prev).await {
                Verdict::Accept => accepted = true,
                Verdict::Reject(reason) => reasons.push(format!("{}: {}", validator.consensus_name(), reason)),
                Verdict::Veto(reason) => {
                    warn!("{}: {} (block {})", validator.consensus_name(), reason, new.index);
                    return Err(ChainError::RejectedMessage(reason));
                }
            }
        }
        if accepted {
            Ok(())
        } else {
            Err(ChainError::InvalidBlock(format!(
                "block {} accepted by no validator [{}]",
                new.index,
                reasons.join("; ")
            )))
        }
    }

    /// Validates, appends, dispatches and optionally announces `block`.
    pub async fn commit_block(&self, block: Block, announce: bool) -> Result<CommitOutcome, ChainError> {
        let state = self.chain.state();
        if !state
            .wait_open_for(self.config.gate_backoff, self.config.gate_max_wait)
            .await
        {
            return Err(ChainError::ChainBusy);
        }
        let _commit = self.commit_lock.lock().await;
        self.commit_locked(block, announce).await
    }

    /// Commit body. The caller holds `commit_lock`.
    async fn commit_locked(&self, block: Block, announce: bool) -> Result<CommitOutcome, ChainError> {
        // a replay may have started while we queued for the lock
        if self.chain.state().is_syncing() {
            return Err(ChainError::ChainBusy);
        }

        if block.index as i64 <= self.chain.height() {
            let stored = self.chain.get_block(block.index)?;
            if stored.hash == block.hash {
                return Ok(CommitOutcome::AlreadyKnown);
            }
            return Err(ChainError::InvalidBlock(format!(
                "block {} conflicts with the local chain",
                block.index
            )));
        }

        let prev = self.chain.latest_block()?;
        self.validate(&block, &prev).await?;
        self.chain.append(block.clone())?;
        info!("Block {} added", block.index);

        let outcome = self.dispatcher.handle_block(&block).await;
        if announce {
            self.announce(&block).await;
        }
        Ok(CommitOutcome::Committed(outcome))
    }

    /// Tells the `block_listeners` group about `block`.
    pub async fn announce(&self, block: &Block) {
        let message = self.relay.create_message(
            json!({ "block": block }),
            BLOCK_LISTENERS_GROUP,
            LATEST_BLOCK_ID,
        );
        self.relay.send_message(&message).await;
    }

    /// Commits a peer's block when it extends the local tip. The chain
    /// response gate is held for the whole intake, so consensus handlers
    /// defer until it is applied.
    pub async fn accept_announced(&self, block: Block) -> Result<Option<CommitOutcome>, ChainError> {
        if block.index as i64 <= self.chain.height() {
            return Ok(None);
        }
        let state = self.chain.state();
        if !state
            .wait_open_for(self.config.gate_backoff, self.config.gate_max_wait)
            .await
        {
            return Err(ChainError::ChainBusy);
        }
        let Some(_response) = state.try_enter(Gate::ChainResponse) else {
            return Err(ChainError::ChainBusy);
        };
        let _commit = self.commit_lock.lock().await;

        let tip = self.chain.latest_block()?;
        if block.index <= tip.index {
            return Ok(None);
        }
        if block.previous_hash != tip.hash {
            debug!("Announced block {} does not extend tip {}", block.index, tip.index);
            return Ok(None);
        }
        self.commit_locked(block, false).await.map(Some)
    }

    /// Produces a block for `payload` with the active validator and commits it.
    /// `Ok(None)` when production was cancelled or nobody produced it in time.
    pub async fn submit(&self, payload: &str) -> Result<Option<Block>, ChainError> {
        let validator = self
            .active_validator()
            .ok_or_else(|| ChainError::ConfigError("no validator is ready".to_string()))?;
        let Some(block) = validator
            .generate_next_block(payload, CancelToken::never(), None)
            .await
        else {
            return Ok(None);
        };
        self.commit_block(block.clone(), true).await?;
        Ok(Some(block))
    }

    pub async fn empty_block_tick(&self) {
        for validator in self.validators() {
            validator.empty_block_tick().await;
        }
    }

    pub fn spawn_empty_block_ticker(&self) -> JoinHandle<()> {
        let engine = self.self_ref.clone();
        let interval = self.config.empty_block_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.empty_block_tick().await;
            }
        })
    }
}
