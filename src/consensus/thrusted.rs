//! Thrusted Nodes: static keyring signature consensus
//!
//! Holders of a keyring key sign blocks directly. Everyone else sends the
//! payload to the `thrusted_node` group and the first holder to pick it up
//! commits it and reports back. Without fresh blocks for a whole freshness
//! window a node without keyring key stops treating this consensus as ready,
//! which lets another validator take over.

use super::delegation::Delegation;
use super::{
    other_consensus_veto, payload_text, payload_value, CancelToken, Validator, ValidatorContext,
    Verdict, BLOCK_ADDED_TAG, THRUSTED_GROUP,
};
use crate::blockchain::{now_millis, Block};
use crate::network::{GossipMessage, HandlerOutcome, MessageHandler, Relay};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONSENSUS_NAME: &str = "Thrusted Nodes";
/// Message id shared by requests and confirmations.
pub const THRUSTED_MESSAGE_ID: &str = "ThrustedNodes";
/// Pause before a holder reports the committed block back.
const CONFIRM_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ThrustedConfig {
    pub freshness_window_ms: i64,
    pub add_message_timeout: Duration,
    pub message_timeout_ms: i64,
    pub generate_empty_block_delay_ms: i64,
}

impl Default for ThrustedConfig {
    fn default() -> Self {
        ThrustedConfig {
            freshness_window_ms: 24 * 60 * 60 * 1000,
            add_message_timeout: Duration::from_secs(10),
            message_timeout_ms: 60_000,
            generate_empty_block_delay_ms: 60_000,
        }
    }
}

pub struct ThrustedValidator {
    ctx: ValidatorContext,
    config: ThrustedConfig,
    delegation: Delegation,
    generate_empty: AtomicBool,
    last_timestamp_request: AtomicI64,
}

impl ThrustedValidator {
    pub fn new(ctx: ValidatorContext, config: ThrustedConfig) -> Arc<Self> {
        let delegation = Delegation::new(CONSENSUS_NAME, config.add_message_timeout);
        let validator = Arc::new(ThrustedValidator {
            ctx,
            config,
            delegation,
            generate_empty: AtomicBool::new(true),
            last_timestamp_request: AtomicI64::new(0),
        });
        validator.ctx.relay.join_group(THRUSTED_GROUP);
        validator
            .ctx
            .relay
            .register_handler(THRUSTED_MESSAGE_ID, validator.clone());
        validator
    }

    pub fn delegation(&self) -> &Delegation {
        &self.delegation
    }

    fn claim_request(&self, timestamp: i64) -> bool {
        now_millis() - timestamp < self.config.message_timeout_ms
            && self
                .last_timestamp_request
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| (last < timestamp).then_some(timestamp))
                .is_ok()
    }

    /// A keyring holder produces the requested block and reports it back.
    async fn serve_request(&self, message: &GossipMessage) {
        if !self.claim_request(message.timestamp) {
            return;
        }
        // the request time is the block time, so two holders build the same block
        let payload = payload_text(&message.data);
        let block = match self.ctx.signed_next_block(&payload, Some(message.timestamp)) {
            Ok(block) => block,
            Err(e) => {
                warn!("Thrusted Nodes: cannot build block for {}: {}", message.sender, e);
                return;
            }
        };
        if let Err(e) = self.ctx.commit(block.clone()).await {
            warn!("Thrusted Nodes: block for {} not added: {}", message.sender, e);
            return;
        }
        info!("Block added for {}", message.sender);

        let relay = Arc::clone(&self.ctx.relay);
        let reply = relay.create_message(
            json!({ "type": BLOCK_ADDED_TAG, "timestamp": message.timestamp, "block": block }),
            &message.sender,
            THRUSTED_MESSAGE_ID,
        );
        tokio::spawn(async move {
            tokio::time::sleep(CONFIRM_DELAY).await;
            relay.send_message(&reply).await;
        });
    }

    fn accept_confirmation(&self, message: &GossipMessage) -> bool {
        if message.data.get("type").and_then(Value::as_str) != Some(BLOCK_ADDED_TAG) {
            return false;
        }
        let timestamp = message.data.get("timestamp").and_then(Value::as_i64);
        let block = message
            .data
            .get("block")
            .cloned()
            .and_then(|b| serde_json::from_value::<Block>(b).ok());
        match (timestamp, block) {
            (Some(timestamp), Some(block)) => self.delegation.resolve(timestamp, block),
            _ => false,
        }
    }

    fn idle_for(&self) -> Option<i64> {
        let tip = self.ctx.chain.latest_block().ok()?;
        Some(now_millis() - tip.timestamp)
    }
}

#[async_trait]
impl MessageHandler for ThrustedValidator {
    async fn handle(&self, relay: &Relay, message: &GossipMessage) -> HandlerOutcome {
        if message.receiver == THRUSTED_GROUP && self.ctx.is_keyring_holder() {
            self.serve_request(message).await;
            return HandlerOutcome::Consumed;
        }
        if message.receiver == relay.address() && self.accept_confirmation(message) {
            return HandlerOutcome::Consumed;
        }
        HandlerOutcome::NotMine
    }
}

#[async_trait]
impl Validator for ThrustedValidator {
    fn consensus_name(&self) -> &'static str {
        CONSENSUS_NAME
    }

    async fn is_valid_new_block(&self, new: &Block, prev: &Block) -> Verdict {
        if new.previous_hash != prev.hash {
            return Verdict::Reject("Invalid block previous hash".to_string());
        }
        if new.timestamp <= prev.timestamp {
            return Verdict::Reject("Invalid timestamps".to_string());
        }
        if let Some(veto) = other_consensus_veto(
            new,
            prev,
            self.config.freshness_window_ms,
            self.ctx.dispatcher.key_emission_max_block(),
        ) {
            return veto;
        }
        if prev.index + 1 != new.index {
            return Verdict::Reject("Invalid block index".to_string());
        }
        if !new.is_signed() {
            return Verdict::Reject("Block is not signed".to_string());
        }
        let signed_by_keyring = self
            .ctx
            .dispatcher
            .keyring()
            .iter()
            .any(|key| self.ctx.identity.verify(&new.hash, &new.sign, key));
        if signed_by_keyring {
            Verdict::Accept
        } else {
            Verdict::Reject("Fake signed block".to_string())
        }
    }

    async fn generate_next_block(&self, payload: &str, cancel: CancelToken, timestamp: Option<i64>) -> Option<Block> {
        if cancel.is_cancelled() {
            return None;
        }
        if !self.ctx.is_keyring_holder() {
            return self
                .delegation
                .delegate(&self.ctx.relay, THRUSTED_MESSAGE_ID, payload_value(payload), THRUSTED_GROUP)
                .await;
        }
        match self.ctx.signed_next_block(payload, timestamp) {
            Ok(block) => Some(block),
            Err(e) => {
                warn!("Thrusted Nodes: cannot build block: {}", e);
                None
            }
        }
    }

    fn is_valid_hash(&self, _hash: &str) -> bool {
        true
    }

    /// A keyring holder is always ready and silences idle blocks elsewhere.
    /// Anyone else is ready while a keyring exists and the tip is fresh.
    fn is_ready(&self) -> bool {
        if self.ctx.is_keyring_holder() {
            if let Some(engine) = self.ctx.engine() {
                engine.disable_empty_blocks_except(CONSENSUS_NAME);
            }
            return true;
        }
        if !self.ctx.dispatcher.has_keyring() {
            return false;
        }
        match self.idle_for() {
            Some(idle) => idle <= self.config.freshness_window_ms,
            None => false,
        }
    }

    async fn generate_empty_block(&self) -> Option<Block> {
        if !self.is_ready() {
            return None;
        }
        let payload = self.ctx.empty_payload().ok()?;
        let block = self.generate_next_block(&payload, CancelToken::never(), None).await?;
        match self.ctx.commit(block.clone()).await {
            Ok(_) => Some(block),
            Err(e) => {
                warn!("Thrusted Nodes: empty block not added: {}", e);
                None
            }
        }
    }

    fn set_generate_empty_blocks(&self, generate: bool) {
        self.generate_empty.store(generate, Ordering::SeqCst);
    }

    fn generates_empty_blocks(&self) -> bool {
        self.generate_empty.load(Ordering::SeqCst)
    }

    async fn empty_block_tick(&self) {
        if !self.generates_empty_blocks() {
            return;
        }
        if !self.ctx.is_keyring_holder() {
            info!("We can't generate empty Thrusted blocks");
            self.set_generate_empty_blocks(false);
            return;
        }
        match self.idle_for() {
            Some(idle) if idle > self.config.generate_empty_block_delay_ms => {
                debug!("Create empty block");
                self.generate_empty_block().await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Blockchain, ChainState};
    use crate::consensus::{ConsensusEngine, EngineConfig};
    use crate::crypto::NodeIdentity;
    use crate::dispatch::BlockDispatcher;
    use crate::keyring::KeyringFile;
    use crate::network::{LocalMesh, RelayConfig};
    use crate::persistence::InMemoryPersistence;
    use tempfile::TempDir;

    fn setup(identity: Arc<NodeIdentity>, keyring: &[String], genesis_age_ms: i64) -> (Arc<ConsensusEngine>, Arc<ThrustedValidator>, TempDir) {
        let dir = TempDir::new().unwrap();
        let file = KeyringFile::in_dir(dir.path());
        if !keyring.is_empty() {
            file.save(keyring).unwrap();
        }
        let store = Arc::new(InMemoryPersistence::new());
        let chain = Arc::new(Blockchain::open(store, Arc::new(ChainState::new())).unwrap());
        chain.ensure_genesis(Block::genesis(now_millis() - genesis_age_ms)).unwrap();
        let mesh = LocalMesh::new();
        let (peers, _inbox) = mesh.join("t");
        let relay = Arc::new(Relay::new(RelayConfig::new("t"), peers));
        let dispatcher = Arc::new(BlockDispatcher::new(identity.public_key_hex(), Some(file), false));
        let engine = ConsensusEngine::new(chain, dispatcher, relay, identity, EngineConfig::default());
        let validator = ThrustedValidator::new(
            engine.context(),
            ThrustedConfig {
                add_message_timeout: Duration::from_millis(100),
                ..ThrustedConfig::default()
            },
        );
        engine.register_validator(validator.clone());
        (engine, validator, dir)
    }

    #[tokio::test]
    async fn test_keyring_holder_signs_directly() {
        let identity = Arc::new(NodeIdentity::generate());
        let keyring = vec![identity.public_key_hex()];
        let (engine, validator, _dir) = setup(Arc::clone(&identity), &keyring, 10_000);

        assert!(validator.is_ready());
        let block = engine.submit("{\"type\":\"Transfer\"}").await.unwrap().unwrap();
        assert!(block.is_signed());
        assert_eq!(engine.chain().height(), 1);
    }

    #[tokio::test]
    async fn test_signature_must_come_from_keyring() {
        let holder = NodeIdentity::generate();
        let local = Arc::new(NodeIdentity::generate());
        let keyring = vec![holder.public_key_hex()];
        let (engine, validator, _dir) = setup(local, &keyring, 10_000);

        let prev = engine.chain().latest_block().unwrap();
        let ts = prev.timestamp + 1;
        let block = Block::new(1, prev.hash.clone(), ts, ts, "{}".into());
        let good = block.clone().with_signature(holder.sign(&block.hash).unwrap());
        assert_eq!(validator.is_valid_new_block(&good, &prev).await, Verdict::Accept);

        let outsider = NodeIdentity::generate();
        let fake = block.clone().with_signature(outsider.sign(&block.hash).unwrap());
        assert_eq!(
            validator.is_valid_new_block(&fake, &prev).await,
            Verdict::Reject("Fake signed block".to_string())
        );
    }

    #[tokio::test]
    async fn test_readiness_without_keyring_key() {
        let holder = NodeIdentity::generate();
        let keyring = vec![holder.public_key_hex()];

        let (_engine, fresh, _d1) = setup(Arc::new(NodeIdentity::generate()), &keyring, 10_000);
        assert!(fresh.is_ready());

        let day = 24 * 60 * 60 * 1000;
        let (_engine, stale, _d2) = setup(Arc::new(NodeIdentity::generate()), &keyring, day + 60_000);
        assert!(!stale.is_ready());

        let (_engine, no_keyring, _d3) = setup(Arc::new(NodeIdentity::generate()), &[], 10_000);
        assert!(!no_keyring.is_ready());
    }

    #[tokio::test]
    async fn test_non_holder_stops_idle_generation() {
        let (_engine, validator, _dir) = setup(Arc::new(NodeIdentity::generate()), &[], 10_000);
        assert!(validator.generates_empty_blocks());
        validator.empty_block_tick().await;
        assert!(!validator.generates_empty_blocks());
    }
}
