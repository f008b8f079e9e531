//! LCPoA: Limited Confidence Proof of Activity
//!
//! A block is valid when its hash ends in one of the accepted suffixes.
//! Mining re-hashes the candidate with a fresh timestamp on every poll until
//! the suffix matches.

use super::{CancelToken, Validator, ValidatorContext, Verdict};
use crate::blockchain::{is_fixed_width_millis, now_millis, Block};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CONSENSUS_NAME: &str = "LCPoA";

/// Delay before retrying when the chain has no tip yet.
const NO_TIP_BACKOFF: Duration = Duration::from_secs(5);
/// Future drift tolerated on block timestamps.
const MAX_CLOCK_DRIFT_MS: i64 = 1_000;

pub fn default_block_endls() -> Vec<String> {
    ["f3c8", "a000", "0000", "7027"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct LcpoaConfig {
    pub block_endls: Vec<String>,
    /// Pause between two hash attempts.
    pub variant_time: Duration,
    /// Idle blocks are only mined with more peers than this.
    pub min_peers_for_empty: usize,
    pub generate_empty_block_delay_ms: i64,
    pub mining_disabled: bool,
}

impl Default for LcpoaConfig {
    fn default() -> Self {
        LcpoaConfig {
            block_endls: default_block_endls(),
            variant_time: Duration::from_millis(10),
            min_peers_for_empty: 2,
            generate_empty_block_delay_ms: 60_000,
            mining_disabled: false,
        }
    }
}

pub struct LcpoaValidator {
    ctx: ValidatorContext,
    config: LcpoaConfig,
    endls: HashSet<String>,
    generate_empty: AtomicBool,
    mining_now: AtomicUsize,
    next_miner: AtomicU64,
    hash_rates: RwLock<HashMap<u64, f64>>,
}

/// Counts one running miner for as long as it lives.
struct MinerSlot<'a> {
    validator: &'a LcpoaValidator,
    id: u64,
}

impl<'a> MinerSlot<'a> {
    fn start(validator: &'a LcpoaValidator) -> Self {
        validator.mining_now.fetch_add(1, Ordering::SeqCst);
        let id = validator.next_miner.fetch_add(1, Ordering::SeqCst) + 1;
        MinerSlot { validator, id }
    }
}

impl Drop for MinerSlot<'_> {
    fn drop(&mut self) {
        self.validator.mining_now.fetch_sub(1, Ordering::SeqCst);
        self.validator.hash_rates.write().remove(&self.id);
    }
}

impl LcpoaValidator {
    pub fn new(ctx: ValidatorContext, config: LcpoaConfig) -> Arc<Self> {
        let endls = config.block_endls.iter().cloned().collect();
        Arc::new(LcpoaValidator {
            ctx,
            config,
            endls,
            generate_empty: AtomicBool::new(false),
            mining_now: AtomicUsize::new(0),
            next_miner: AtomicU64::new(0),
            hash_rates: RwLock::new(HashMap::new()),
        })
    }

    pub fn mining_now(&self) -> usize {
        self.mining_now.load(Ordering::SeqCst)
    }

    /// Hashes per second of every running miner.
    pub fn hash_rates(&self) -> HashMap<u64, f64> {
        self.hash_rates.read().clone()
    }

    fn check(&self, new: &Block, prev: &Block) -> Result<(), String> {
        if prev.index + 1 != new.index {
            return Err(format!("Invalid block index {}", new.index));
        }
        if prev.hash != new.previous_hash || !self.is_valid_hash(&new.hash) {
            return Err(format!("Invalid block previous hash or new hash in {}", new.index));
        }
        if prev.index != 0 && !self.is_valid_hash(&prev.hash) && !prev.is_signed() {
            return Err("Invalid previous block hash".to_string());
        }
        if !new.has_consistent_hash() {
            return Err(format!("Invalid hash for block {}: {}", new.index, new.compute_hash()));
        }
        if new.start_timestamp > new.timestamp || prev.timestamp > new.timestamp {
            return Err("Invalid start or block timestamp".to_string());
        }
        if new.timestamp > now_millis() + MAX_CLOCK_DRIFT_MS {
            return Err("Invalid local time or block creator time".to_string());
        }
        if !is_fixed_width_millis(new.timestamp) || !is_fixed_width_millis(new.start_timestamp) {
            return Err("Invalid timestamp number".to_string());
        }
        Ok(())
    }

    async fn mine(&self, payload: &str, cancel: &CancelToken) -> Option<Block> {
        let slot = MinerSlot::start(self);
        let start_timestamp = now_millis();
        let mut attempts = 0u64;
        let mut window = Instant::now();
        info!("Mining: Miner #{} started", slot.id);

        loop {
            if cancel.is_cancelled() {
                info!("Mining: Miner #{} aborted", slot.id);
                return None;
            }
            let prev = match self.ctx.chain.latest_block() {
                Ok(prev) => prev,
                Err(e) => {
                    debug!("Mining: no tip yet ({}), retrying", e);
                    tokio::time::sleep(NO_TIP_BACKOFF).await;
                    continue;
                }
            };

            let candidate = Block::new(
                prev.index + 1,
                prev.hash.clone(),
                now_millis(),
                start_timestamp,
                payload.to_string(),
            );
            attempts += 1;

            let elapsed = window.elapsed();
            if elapsed >= Duration::from_secs(1) {
                let rate = attempts as f64 / elapsed.as_secs_f64();
                self.hash_rates.write().insert(slot.id, rate);
                debug!("Miner #{}: Speed {:.1} H/s", slot.id, rate);
                attempts = 0;
                window = Instant::now();
            }

            if self.is_valid_hash(&candidate.hash) {
                info!("Mining: New block found {}", candidate.hash);
                return Some(candidate);
            }
            tokio::time::sleep(self.config.variant_time).await;
        }
    }

    fn idle_for(&self) -> Option<i64> {
        let tip = self.ctx.chain.latest_block().ok()?;
        Some(now_millis() - tip.timestamp)
    }
}

#[async_trait]
impl Validator for LcpoaValidator {
    fn consensus_name(&self) -> &'static str {
        CONSENSUS_NAME
    }

    async fn is_valid_new_block(&self, new: &Block, prev: &Block) -> Verdict {
        match self.check(new, prev) {
            Ok(()) => Verdict::Accept,
            Err(reason) => Verdict::Reject(reason),
        }
    }

    /// The timestamp hint is ignored; every attempt uses the current time.
    async fn generate_next_block(&self, payload: &str, cancel: CancelToken, _timestamp: Option<i64>) -> Option<Block> {
        self.mine(payload, &cancel).await
    }

    fn is_valid_hash(&self, hash: &str) -> bool {
        hash.len()
            .checked_sub(4)
            .and_then(|start| hash.get(start..))
            .map_or(false, |suffix| self.endls.contains(suffix))
    }

    fn is_ready(&self) -> bool {
        !self.config.mining_disabled
    }

    async fn generate_empty_block(&self) -> Option<Block> {
        if self.ctx.relay.peer_count() <= self.config.min_peers_for_empty
            || self.mining_now() > 0
            || self.ctx.chain.state().is_syncing()
        {
            return None;
        }
        if self.idle_for()? <= self.config.generate_empty_block_delay_ms {
            return None;
        }

        let payload = self.ctx.empty_payload().ok()?;
        let cancel = CancelToken::on_height_change(Arc::clone(self.ctx.chain.state()));
        let block = self.mine(&payload, &cancel).await?;

        // someone may have added a block while we were mining
        if self.idle_for()? <= self.config.generate_empty_block_delay_ms {
            return None;
        }
        match self.ctx.commit(block.clone()).await {
            Ok(_) => Some(block),
            Err(e) => {
                warn!("LCPoA: We generated a bad block: {}", e);
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
}
