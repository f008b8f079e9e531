use crate::cache::BlockCache;
use crate::error::ChainError;
use crate::persistence::BlockStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use super::state::ChainState;
use super::validation::validate_linkage;

/// Fixed placeholder mixed into every block hash where the signature slot used to be.
pub const HASH_PLACEHOLDER: &str = "";

/// Number of recently read blocks kept in front of the store.
pub const BLOCK_CACHE_SIZE: usize = 100;

/// Current UTC time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Deterministic block hash over `(index, previousHash, timestamp, startTimestamp, placeholder, data)`.
pub fn calculate_hash(
    index: u64,
    previous_hash: &str,
    timestamp: i64,
    data: &str,
    start_timestamp: i64,
    placeholder: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(previous_hash.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(start_timestamp.to_string().as_bytes());
    hasher.update(placeholder.as_bytes());
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: i64,
    pub start_timestamp: i64,
    pub data: String,
    pub hash: String,
    #[serde(default)]
    pub sign: String,
    #[serde(default)]
    pub wallet: String,
    /// Fee declared by the producer, checked by stake-delegated consensus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<String>,
}

impl Block {
    /// Builds an unsigned block and hashes it.
    pub fn new(
        index: u64,
        previous_hash: String,
        timestamp: i64,
        start_timestamp: i64,
        data: String,
    ) -> Self {
        let hash = calculate_hash(
            index,
            &previous_hash,
            timestamp,
            &data,
            start_timestamp,
            HASH_PLACEHOLDER,
        );
        Block {
            index,
            previous_hash,
            timestamp,
            start_timestamp,
            data,
            hash,
            sign: String::new(),
            wallet: String::new(),
            fee: None,
        }
    }

    /// The first block of a chain. Carries no payload.
    pub fn genesis(timestamp: i64) -> Self {
        Block::new(0, "0".to_string(), timestamp, timestamp, String::new())
    }

    pub fn with_signature(mut self, sign: String) -> Self {
        self.sign = sign;
        self
    }

    pub fn with_wallet(mut self, wallet: String) -> Self {
        self.wallet = wallet;
        self
    }

    pub fn with_fee(mut self, fee: Option<String>) -> Self {
        self.fee = fee;
        self
    }

    pub fn is_signed(&self) -> bool {
        !self.sign.is_empty()
    }

    /// Hash recomputed from the block's own fields.
    pub fn compute_hash(&self) -> String {
        calculate_hash(
            self.index,
            &self.previous_hash,
            self.timestamp,
            &self.data,
            self.start_timestamp,
            HASH_PLACEHOLDER,
        )
    }

    pub fn has_consistent_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ChainError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// View over the persisted chain: the block store, the shared chain state and
/// a small LRU of recently read blocks.
pub struct Blockchain {
    store: Arc<dyn BlockStore>,
    state: Arc<ChainState>,
    cache: BlockCache,
}

impl Blockchain {
    /// Opens the chain on top of a store, loading the stored height into `state`.
    pub fn open(store: Arc<dyn BlockStore>, state: Arc<ChainState>) -> Result<Self, ChainError> {
        let height = store.max_block()?.unwrap_or(-1);
        state.set_max_block(height);
        debug!("Opened chain at height {}", height);
        Ok(Blockchain {
            store,
            state,
            cache: BlockCache::new(BLOCK_CACHE_SIZE),
        })
    }

    /// Writes `genesis` when the store holds no blocks yet.
    pub fn ensure_genesis(&self, genesis: Block) -> Result<(), ChainError> {
        if self.state.max_block() >= 0 {
            return Ok(());
        }
        if genesis.index != 0 {
            return Err(ChainError::InvalidBlock(
                "Genesis block must have index 0".to_string(),
            ));
        }
        info!("Writing genesis block {}", genesis.hash);
        self.store.put_block(&genesis)?;
        self.store.put_max_block(0)?;
        self.state.set_max_block(0);
        Ok(())
    }

    pub fn state(&self) -> &Arc<ChainState> {
        &self.state
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Current height, `-1` for an empty chain.
    pub fn height(&self) -> i64 {
        self.state.max_block()
    }

    pub fn get_block(&self, index: u64) -> Result<Block, ChainError> {
        if let Some(block) = self.cache.get(index) {
            return Ok(block);
        }
        let block = self.store.get_block(index)?;
        self.cache.put(block.clone());
        Ok(block)
    }

    /// Cached blocks and cache capacity.
    pub fn cache_stats(&self) -> (usize, usize) {
        self.cache.stats()
    }

    pub fn latest_block(&self) -> Result<Block, ChainError> {
        let height = self.height();
        if height < 0 {
            return Err(ChainError::BlockNotFound(0));
        }
        self.get_block(height as u64)
    }

    /// Appends a block that links onto the current tip and advances the height.
    /// Consensus rules are the caller's business; only linkage is checked here.
    pub fn append(&self, block: Block) -> Result<(), ChainError> {
        let tip = self.latest_block()?;
        validate_linkage(&block, &tip)?;

        self.store.put_block(&block)?;
        self.store.put_max_block(block.index as i64)?;
        self.state.advance_to(block.index as i64);
        self.cache.put(block);
        Ok(())
    }

    /// Deletes every block from `index` onward and rewrites the height to `index - 1`.
    pub fn truncate_from(&self, index: u64) -> Result<(), ChainError> {
        let height = self.height();
        let mut i = index as i64;
        while i <= height {
            self.store.delete_block(i as u64)?;
            self.cache.evict(i as u64);
            i += 1;
        }
        let new_height = index as i64 - 1;
        self.store.put_max_block(new_height)?;
        self.state.set_max_block(new_height);
        Ok(())
    }
}
