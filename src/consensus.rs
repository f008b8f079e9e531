//! Pluggable block validators
//!
//! Every variant implements [`Validator`]. The [`engine::ConsensusEngine`]
//! asks all registered validators about an incoming block and lets exactly one
//! of them, the active one, produce blocks.

pub mod contracts;
pub mod delegation;
pub mod engine;
pub mod lcpoa;
pub mod pos;
pub mod thrusted;

pub use contracts::{ContractGateway, ContractQuery, NoContracts, WhitelistContract};
pub use delegation::Delegation;
pub use engine::{CommitOutcome, ConsensusEngine, EngineConfig};
pub use lcpoa::{LcpoaConfig, LcpoaValidator};
pub use pos::{PosConfig, PosValidator};
pub use thrusted::{ThrustedConfig, ThrustedValidator};

use crate::blockchain::{now_millis, Block, Blockchain, ChainState};
use crate::crypto::NodeIdentity;
use crate::dispatch::BlockDispatcher;
use crate::error::ChainError;
use crate::network::Relay;
use crate::payload::Signable;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Logical address every delegating validator listens on.
pub const THRUSTED_GROUP: &str = "thrusted_node";
/// Data tag of a delegated block confirmation.
pub const BLOCK_ADDED_TAG: &str = "thrusted_block_add";

/// Answer of one validator about one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Not valid under this validator's rules. Another validator may still accept.
    Reject(String),
    /// Refused outright, whatever the other validators say.
    Veto(String),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Polled by block production before each unit of work.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    height: Option<(Arc<ChainState>, i64)>,
}

impl CancelToken {
    pub fn never() -> Self {
        Self::default()
    }

    /// Cancelled as soon as the chain height moves away from its current value.
    pub fn on_height_change(state: Arc<ChainState>) -> Self {
        let height = state.max_block();
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            height: Some((state, height)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.height {
            Some((state, height)) => state.max_block() != *height,
            None => false,
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn consensus_name(&self) -> &'static str;

    async fn is_valid_new_block(&self, new: &Block, prev: &Block) -> Verdict;

    /// Produces the next block carrying `payload`. `None` means production was
    /// cancelled or no delegate answered.
    async fn generate_next_block(
        &self,
        payload: &str,
        cancel: CancelToken,
        timestamp: Option<i64>,
    ) -> Option<Block>;

    fn is_valid_hash(&self, hash: &str) -> bool;

    fn is_ready(&self) -> bool;

    /// Produces and commits a heartbeat block. Returns it when committed.
    async fn generate_empty_block(&self) -> Option<Block>;

    fn set_generate_empty_blocks(&self, generate: bool);

    fn generates_empty_blocks(&self) -> bool;

    /// One step of idle network support, run on the engine's empty block tick.
    async fn empty_block_tick(&self) {
        if self.generates_empty_blocks() {
            self.generate_empty_block().await;
        }
    }
}

/// Everything a validator needs from the node.
#[derive(Clone)]
pub struct ValidatorContext {
    pub chain: Arc<Blockchain>,
    pub dispatcher: Arc<BlockDispatcher>,
    pub relay: Arc<Relay>,
    pub identity: Arc<NodeIdentity>,
    pub(crate) engine: Weak<ConsensusEngine>,
}

impl ValidatorContext {
    pub fn local_key(&self) -> String {
        self.identity.public_key_hex()
    }

    pub fn is_keyring_holder(&self) -> bool {
        self.dispatcher.is_key_from_keyring(&self.local_key())
    }

    pub fn engine(&self) -> Option<Arc<ConsensusEngine>> {
        self.engine.upgrade()
    }

    /// Validates and appends through the engine.
    pub async fn commit(&self, block: Block) -> Result<CommitOutcome, ChainError> {
        let engine = self
            .engine()
            .ok_or_else(|| ChainError::ConfigError("consensus engine is gone".to_string()))?;
        engine.commit_block(block, true).await
    }

    /// Signed block on top of the current tip. Producer and start time are
    /// both `timestamp` when given, so racing delegates build the same block.
    pub fn signed_next_block(&self, payload: &str, timestamp: Option<i64>) -> Result<Block, ChainError> {
        let prev = self.chain.latest_block()?;
        let ts = timestamp.unwrap_or_else(now_millis);
        let block = Block::new(prev.index + 1, prev.hash.clone(), ts, ts, payload.to_string());
        let sign = self.identity.sign(&block.hash)?;
        let wallet = payload_field(payload, "wallet")
            .and_then(|w| w.as_str().map(str::to_string))
            .unwrap_or_default();
        Ok(block.with_signature(sign).with_wallet(wallet))
    }

    /// Heartbeat payload stamped with this node's key.
    pub fn empty_payload(&self) -> Result<String, ChainError> {
        let mut empty = Signable::empty();
        empty
            .extra
            .insert("state".to_string(), json!({ "from": self.local_key() }));
        empty.to_canonical_json()
    }
}

/// Reads a top level field of a JSON payload.
pub fn payload_field(payload: &str, name: &str) -> Option<Value> {
    serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|v| v.get(name).cloned())
}

/// Payload as it travels inside delegation messages.
pub fn payload_value(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

/// Inverse of [`payload_value`].
pub fn payload_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Unsigned blocks from another consensus arriving within `window` of the
/// previous block are refused once the chain is past the bootstrap blocks.
pub fn other_consensus_veto(new: &Block, prev: &Block, window_ms: i64, bootstrap_index: u64) -> Option<Verdict> {
    if new.timestamp - prev.timestamp < window_ms && !new.is_signed() && new.index > bootstrap_index {
        return Some(Verdict::Veto(
            "Adding other consensus block disabled due security configuration".to_string(),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_follows_height() {
        let state = Arc::new(ChainState::new());
        state.set_max_block(3);
        let token = CancelToken::on_height_change(Arc::clone(&state));
        assert!(!token.is_cancelled());
        state.advance_to(4);
        assert!(token.is_cancelled());

        let manual = CancelToken::never();
        let clone = manual.clone();
        assert!(!clone.is_cancelled());
        manual.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_veto_only_for_recent_unsigned_blocks() {
        let prev = Block::new(6, "p".into(), 1_700_000_000_000, 1_700_000_000_000, String::new());
        let unsigned = Block::new(7, prev.hash.clone(), prev.timestamp + 1_000, prev.timestamp, String::new());
        let day = 24 * 60 * 60 * 1000;

        assert!(matches!(other_consensus_veto(&unsigned, &prev, day, 5), Some(Verdict::Veto(_))));
        assert!(other_consensus_veto(&unsigned.clone().with_signature("ab".into()), &prev, day, 5).is_none());
        // bootstrap blocks are exempt
        assert!(other_consensus_veto(&unsigned, &prev, day, 7).is_none());

        let late = Block::new(7, prev.hash.clone(), prev.timestamp + day + 1, prev.timestamp, String::new());
        assert!(other_consensus_veto(&late, &prev, day, 5).is_none());
    }

    #[test]
    fn test_payload_value_round_trip() {
        assert_eq!(payload_value("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(payload_text(&payload_value("{\"a\":1}")), "{\"a\":1}");
        assert_eq!(payload_text(&payload_value("plain")), "plain");
        assert_eq!(payload_field("{\"wallet\":\"w1\"}", "wallet"), Some(json!("w1")));
    }
}
