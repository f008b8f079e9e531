//! Stake/whitelist delegated consensus
//!
//! Whether a node may produce, and whether a signature belongs to a validator,
//! is decided by the master contract. A node that may not produce asks the
//! `thrusted_node` group:
//!
//! 1. requester broadcasts `SelectAddBlock { blockData }` to the group
//! 2. every listener answers `SelectAddBlockCB { message }` to the requester
//! 3. the first eligible responder gets the request back as `AddBlock`
//! 4. the delegate signs, commits and broadcasts `AddedBlock { block }`
//!
//! Step 3 happens at most once per request.

use super::contracts::{ContractGateway, ContractQuery};
use super::delegation::Delegation;
use super::{
    other_consensus_veto, payload_field, payload_text, payload_value, CancelToken, Validator,
    ValidatorContext, Verdict, BLOCK_ADDED_TAG, THRUSTED_GROUP,
};
use crate::blockchain::{now_millis, Block};
use crate::error::ChainError;
use crate::network::{GossipMessage, HandlerOutcome, MessageHandler, Relay};
use crate::payload::{ContractCall, PayloadKind, Signable};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONSENSUS_NAME: &str = "PoS";

pub const SELECT_ADD_BLOCK: &str = "SelectAddBlock";
pub const SELECT_ADD_BLOCK_CB: &str = "SelectAddBlockCB";
pub const ADD_BLOCK: &str = "AddBlock";
pub const ADDED_BLOCK: &str = "AddedBlock";

#[derive(Debug, Clone)]
pub struct PosConfig {
    pub master_contract: String,
    /// How long a requester waits for a delegate.
    pub add_message_timeout: Duration,
    /// Requests older than this are ignored by delegates.
    pub message_timeout_ms: i64,
    pub gate_backoff: Duration,
    pub generate_empty_block_delay_ms: i64,
    /// Unsigned blocks closer than this to their predecessor are vetoed.
    pub freshness_window_ms: i64,
}

impl Default for PosConfig {
    fn default() -> Self {
        PosConfig {
            master_contract: "1".to_string(),
            add_message_timeout: Duration::from_secs(10),
            message_timeout_ms: 60_000,
            gate_backoff: Duration::from_millis(100),
            generate_empty_block_delay_ms: 60_000,
            freshness_window_ms: 24 * 60 * 60 * 1000,
        }
    }
}

pub struct PosValidator {
    ctx: ValidatorContext,
    config: PosConfig,
    contracts: ContractGateway,
    delegation: Delegation,
    generate_empty: AtomicBool,
    last_timestamp_request: AtomicI64,
}

impl PosValidator {
    pub fn new(ctx: ValidatorContext, config: PosConfig, contracts: Arc<dyn ContractQuery>) -> Arc<Self> {
        let delegation = Delegation::new(CONSENSUS_NAME, config.add_message_timeout);
        let validator = Arc::new(PosValidator {
            ctx,
            config,
            contracts: ContractGateway::new(contracts),
            delegation,
            generate_empty: AtomicBool::new(true),
            last_timestamp_request: AtomicI64::new(0),
        });
        let relay = &validator.ctx.relay;
        relay.join_group(THRUSTED_GROUP);
        for id in [SELECT_ADD_BLOCK, SELECT_ADD_BLOCK_CB, ADD_BLOCK, ADDED_BLOCK] {
            relay.register_handler(id, validator.clone());
        }
        validator
    }

    pub fn delegation(&self) -> &Delegation {
        &self.delegation
    }

    fn master(&self) -> &str {
        &self.config.master_contract
    }

    fn is_fresh(&self, timestamp: i64) -> bool {
        now_millis() - timestamp < self.config.message_timeout_ms
            && self.last_timestamp_request.load(Ordering::SeqCst) < timestamp
    }

    /// Takes a request for production. Only the newest request wins.
    fn claim_request(&self, timestamp: i64) -> bool {
        now_millis() - timestamp < self.config.message_timeout_ms
            && self
                .last_timestamp_request
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| (last < timestamp).then_some(timestamp))
                .is_ok()
    }

    /// Signature check of last resort: the key named in the payload's `state.from`.
    fn signed_by_declared_sender(&self, block: &Block) -> bool {
        payload_field(&block.data, "state")
            .and_then(|state| state.get("from").and_then(Value::as_str).map(str::to_string))
            .map_or(false, |from| self.ctx.identity.verify(&block.hash, &block.sign, &from))
    }

    async fn may_produce(&self) -> bool {
        if !self.contracts.contract_exists(self.master()).await {
            return true;
        }
        self.contracts
            .can_validate(self.master(), &self.ctx.local_key(), &[])
            .await
    }

    /// Re-issues the requester's payload under this node's key.
    fn restamp(&self, block_data: &Value) -> Result<String, ChainError> {
        let Ok(mut signable) = serde_json::from_value::<Signable>(block_data.clone()) else {
            return Ok(payload_text(block_data));
        };
        if let Ok(mut call) = ContractCall::from_signable(&signable) {
            match &mut call.state {
                Value::Object(state) => {
                    state.insert("from".to_string(), json!(self.ctx.local_key()));
                }
                other => *other = json!({ "from": self.ctx.local_key() }),
            }
            signable = call.to_signable()?;
        }
        signable.sign_with(&self.ctx.identity)?;
        signable.to_canonical_json()
    }

    async fn on_select_add_block(&self, relay: &Relay, message: &GossipMessage) {
        if message.receiver != THRUSTED_GROUP {
            return;
        }
        let reply = relay.create_message(json!({ "message": message }), &message.sender, SELECT_ADD_BLOCK_CB);
        relay.send_message(&reply).await;
    }

    async fn on_select_add_block_cb(&self, relay: &Relay, message: &GossipMessage) {
        if message.receiver != relay.address() {
            return;
        }
        let Some(Ok(request)) = message
            .data
            .get("message")
            .cloned()
            .map(serde_json::from_value::<GossipMessage>)
        else {
            debug!("Malformed {} from {}", SELECT_ADD_BLOCK_CB, message.sender);
            return;
        };
        if !self.is_fresh(request.timestamp) || !self.delegation.is_pending(request.timestamp) {
            return;
        }

        let online = relay.peers().peers();
        if !self.contracts.can_validate(self.master(), &message.sender, &online).await {
            return;
        }
        if self.delegation.mark_sent_on_validation(request.timestamp) {
            info!("Sending to {} block addition request", message.sender);
            let Ok(data) = serde_json::to_value(&request) else {
                return;
            };
            let add = relay.create_message(data, &message.sender, ADD_BLOCK);
            relay.send_message(&add).await;
        }
    }

    async fn on_add_block(&self, relay: &Relay, message: &GossipMessage) {
        if message.receiver != relay.address() {
            return;
        }
        let Ok(request) = serde_json::from_value::<GossipMessage>(message.data.clone()) else {
            debug!("Malformed {} from {}", ADD_BLOCK, message.sender);
            return;
        };
        if !self.claim_request(request.timestamp) {
            return;
        }

        let block_data = request.data.get("blockData").cloned().unwrap_or(Value::Null);
        let produced = self
            .restamp(&block_data)
            .and_then(|payload| self.ctx.signed_next_block(&payload, Some(request.timestamp)));
        let block = match produced {
            Ok(block) => block,
            Err(e) => {
                warn!("Failed to build block for {}: {}", request.sender, e);
                return;
            }
        };
        // the request timestamp is the block time, so a duplicate delegate fails here
        if let Err(e) = self.ctx.commit(block.clone()).await {
            warn!("Block for {} not added: {}", request.sender, e);
            return;
        }
        info!("Block with index {} added for {}", block.index, request.sender);

        let added = relay.create_message(
            json!({ "type": BLOCK_ADDED_TAG, "timestamp": request.timestamp, "block": block }),
            THRUSTED_GROUP,
            ADDED_BLOCK,
        );
        relay.send_message(&added).await;
    }

    async fn on_added_block(&self, message: &GossipMessage) {
        if message.data.get("type").and_then(Value::as_str) != Some(BLOCK_ADDED_TAG) {
            return;
        }
        let timestamp = message.data.get("timestamp").and_then(Value::as_i64);
        let block = message
            .data
            .get("block")
            .cloned()
            .and_then(|b| serde_json::from_value::<Block>(b).ok());
        let (Some(timestamp), Some(block)) = (timestamp, block) else {
            return;
        };

        if self.delegation.resolve(timestamp, block.clone()) {
            return;
        }
        let Ok(tip) = self.ctx.chain.latest_block() else {
            return;
        };
        if block.previous_hash == tip.hash {
            if let Err(e) = self.ctx.commit(block).await {
                debug!("Delegated block not added: {}", e);
            }
        }
    }
}

#[async_trait]
impl MessageHandler for PosValidator {
    async fn handle(&self, relay: &Relay, message: &GossipMessage) -> HandlerOutcome {
        self.ctx.chain.state().wait_open(self.config.gate_backoff).await;
        match message.id.as_str() {
            SELECT_ADD_BLOCK => self.on_select_add_block(relay, message).await,
            SELECT_ADD_BLOCK_CB => self.on_select_add_block_cb(relay, message).await,
            ADD_BLOCK => self.on_add_block(relay, message).await,
            ADDED_BLOCK => self.on_added_block(message).await,
            _ => return HandlerOutcome::NotMine,
        }
        HandlerOutcome::Consumed
    }
}

#[async_trait]
impl Validator for PosValidator {
    fn consensus_name(&self) -> &'static str {
        CONSENSUS_NAME
    }

    async fn is_valid_new_block(&self, new: &Block, prev: &Block) -> Verdict {
        if new.previous_hash != prev.hash {
            return Verdict::Reject("Invalid block previous hash".to_string());
        }
        // blocks that coincide in time are rejected, which settles racing delegates
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
        if matches!(new.index, 1 | 2) {
            return Verdict::Accept;
        }

        let valid_wallet = self.contracts.check_block_sign(self.master(), new).await
            || self.signed_by_declared_sender(new);
        if !valid_wallet {
            return Verdict::Reject("Block signature is not from a validator".to_string());
        }
        if let Some(fee) = &new.fee {
            match self.contracts.fee_from_block(self.master(), new).await {
                Ok(Some(expected)) if &expected == fee => {}
                Ok(_) => return Verdict::Reject(format!("Declared fee {} does not match", fee)),
                Err(e) => return Verdict::Reject(format!("Fee check failed: {}", e)),
            }
        }
        Verdict::Accept
    }

    async fn generate_next_block(&self, payload: &str, cancel: CancelToken, timestamp: Option<i64>) -> Option<Block> {
        if cancel.is_cancelled() {
            return None;
        }
        if !self.may_produce().await {
            let data = json!({ "blockData": payload_value(payload) });
            return self
                .delegation
                .delegate(&self.ctx.relay, SELECT_ADD_BLOCK, data, THRUSTED_GROUP)
                .await;
        }
        match self.ctx.signed_next_block(payload, timestamp) {
            Ok(block) => Some(block),
            Err(e) => {
                warn!("PoS: cannot build block: {}", e);
                None
            }
        }
    }

    /// Any hash is valid here; signatures carry the weight.
    fn is_valid_hash(&self, _hash: &str) -> bool {
        true
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn generate_empty_block(&self) -> Option<Block> {
        info!("Generate empty block");
        let payload = self.ctx.empty_payload().ok()?;
        let block = self.generate_next_block(&payload, CancelToken::never(), None).await?;
        match self.ctx.commit(block.clone()).await {
            Ok(_) => Some(block),
            Err(e) => {
                warn!("PoS: empty block not added: {}", e);
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
        let Ok(tip) = self.ctx.chain.latest_block() else {
            return;
        };
        if now_millis() - tip.timestamp > self.config.generate_empty_block_delay_ms {
            info!("Create empty block");
            self.generate_empty_block().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Blockchain, ChainState};
    use crate::consensus::contracts::NoContracts;
    use crate::consensus::{ConsensusEngine, EngineConfig, WhitelistContract};
    use crate::crypto::{NodeIdentity, Secp256k1Scheme};
    use crate::dispatch::BlockDispatcher;
    use crate::network::{LocalMesh, RelayConfig};
    use crate::persistence::InMemoryPersistence;

    fn setup(contracts: Arc<dyn ContractQuery>, identity: Arc<NodeIdentity>) -> (Arc<ConsensusEngine>, Arc<PosValidator>) {
        setup_with_emission(contracts, identity, crate::dispatch::KEY_EMISSION_MAX_BLOCK)
    }

    fn setup_with_emission(
        contracts: Arc<dyn ContractQuery>,
        identity: Arc<NodeIdentity>,
        key_emission_max_block: u64,
    ) -> (Arc<ConsensusEngine>, Arc<PosValidator>) {
        let store = Arc::new(InMemoryPersistence::new());
        let chain = Arc::new(Blockchain::open(store, Arc::new(ChainState::new())).unwrap());
        chain.ensure_genesis(Block::genesis(now_millis() - 10_000)).unwrap();
        let mesh = LocalMesh::new();
        let (peers, _inbox) = mesh.join("pos");
        let relay = Arc::new(Relay::new(RelayConfig::new("pos"), peers));
        let dispatcher = Arc::new(
            BlockDispatcher::new(identity.public_key_hex(), None, false)
                .with_key_emission_max_block(key_emission_max_block),
        );
        let config = EngineConfig {
            active: CONSENSUS_NAME.into(),
            ..EngineConfig::default()
        };
        let engine = ConsensusEngine::new(chain, dispatcher, relay, identity, config);
        let pos_config = PosConfig {
            add_message_timeout: Duration::from_millis(100),
            ..PosConfig::default()
        };
        let validator = PosValidator::new(engine.context(), pos_config, contracts);
        engine.register_validator(validator.clone());
        (engine, validator)
    }

    #[tokio::test]
    async fn test_without_contract_node_produces_locally() {
        let identity = Arc::new(NodeIdentity::generate());
        let (engine, _validator) = setup(Arc::new(NoContracts), Arc::clone(&identity));
        let anonymous = Signable::new("Transfer", "x".into()).to_canonical_json().unwrap();
        // blocks 1 and 2 need no signature check
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert!(engine.submit(&anonymous).await.unwrap().is_some());
        }

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(matches!(engine.submit(&anonymous).await, Err(ChainError::InvalidBlock(_))));
        assert_eq!(engine.chain().height(), 2);

        let declared = json!({ "type": "Transfer", "state": { "from": identity.public_key_hex() } }).to_string();
        assert!(engine.submit(&declared).await.unwrap().is_some());
        assert_eq!(engine.chain().height(), 3);
    }

    #[tokio::test]
    async fn test_whitelisted_signature_and_fee() {
        let identity = Arc::new(NodeIdentity::generate());
        let contract = WhitelistContract::new("1", vec![identity.public_key_hex()], Arc::new(Secp256k1Scheme))
            .with_flat_fee("5");
        let (engine, validator) = setup(Arc::new(contract), Arc::clone(&identity));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert!(engine.submit("{\"type\":\"Transfer\"}").await.unwrap().is_some());
        }
        assert_eq!(engine.chain().height(), 3);

        let prev = engine.chain().latest_block().unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let ctx = engine.context();
        let block = ctx.signed_next_block("{}", None).unwrap();
        assert_eq!(
            validator.is_valid_new_block(&block.clone().with_fee(Some("5".into())), &prev).await,
            Verdict::Accept
        );
        assert!(matches!(
            validator.is_valid_new_block(&block.clone().with_fee(Some("6".into())), &prev).await,
            Verdict::Reject(_)
        ));

        let stranger = NodeIdentity::generate();
        let forged = block.clone().with_signature(stranger.sign(&block.hash).unwrap());
        assert!(matches!(validator.is_valid_new_block(&forged, &prev).await, Verdict::Reject(_)));
    }

    #[tokio::test]
    async fn test_ineligible_node_delegates_and_times_out() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let identity = Arc::new(NodeIdentity::generate());
            let contract = WhitelistContract::new("1", vec![], Arc::new(Secp256k1Scheme));
            let (engine, validator) = setup(Arc::new(contract), identity);

            assert_eq!(engine.submit("{\"type\":\"Transfer\"}").await.unwrap(), None);
            assert_eq!(validator.delegation().pending_len(), 0);
            assert_eq!(engine.chain().height(), 0);
        })
        .await
        .expect("test_ineligible_node_delegates_and_times_out timed out");
    }

    #[tokio::test]
    async fn test_unsigned_recent_block_is_vetoed() {
        let identity = Arc::new(NodeIdentity::generate());
        let (_engine, validator) = setup(Arc::new(NoContracts), identity);
        let prev = Block::new(9, "p".into(), 1_700_000_000_000, 1_700_000_000_000, String::new());
        let unsigned = Block::new(10, prev.hash.clone(), prev.timestamp + 5, prev.timestamp + 5, String::new());
        assert!(matches!(validator.is_valid_new_block(&unsigned, &prev).await, Verdict::Veto(_)));

        let same_time = Block::new(10, prev.hash.clone(), prev.timestamp, prev.timestamp, String::new());
        assert!(matches!(validator.is_valid_new_block(&same_time, &prev).await, Verdict::Reject(_)));
    }

    #[tokio::test]
    async fn test_veto_follows_configured_key_emission_index() {
        let identity = Arc::new(NodeIdentity::generate());
        let (_engine, validator) = setup_with_emission(Arc::new(NoContracts), identity, 20);
        let prev = Block::new(9, "p".into(), 1_700_000_000_000, 1_700_000_000_000, String::new());
        let unsigned = Block::new(10, prev.hash.clone(), prev.timestamp + 5, prev.timestamp + 5, String::new());
        // block 10 is still a bootstrap block on this network, so it is only rejected
        assert_eq!(
            validator.is_valid_new_block(&unsigned, &prev).await,
            Verdict::Reject("Block is not signed".to_string())
        );
    }
}
