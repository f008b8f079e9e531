//! Ledger guard: sequential replay and repair of the persisted chain
//!
//! Replay walks the stored chain from block 0 to the stored height, checks
//! every link and hands each block to the dispatcher. A broken link is either
//! fatal or repaired by truncating everything from the divergence point on,
//! depending on the autofix setting.

use crate::blockchain::{Block, Blockchain, Gate};
use crate::dispatch::BlockDispatcher;
use crate::error::ChainError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Result of one replay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncReport {
    /// The whole chain was consistent and every block was dispatched.
    Replayed { blocks: u64 },
    /// The chain diverged at `divergence` and was cut back to `height`.
    Truncated { divergence: u64, height: i64 },
    /// Another replay already holds the sync gate.
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayStats {
    pub runs: u64,
    pub truncations: u64,
    pub blocks_replayed: u64,
    pub last_duration: Duration,
}

pub struct LedgerGuard {
    chain: Arc<Blockchain>,
    dispatcher: Arc<BlockDispatcher>,
    autofix: bool,
    stats: parking_lot::Mutex<ReplayStats>,
}

/// Restores dispatcher logging when a replay ends, however it ends.
struct QuietScope<'a>(&'a BlockDispatcher);

impl Drop for QuietScope<'_> {
    fn drop(&mut self) {
        self.0.set_quiet(false);
    }
}

impl LedgerGuard {
    pub fn new(chain: Arc<Blockchain>, dispatcher: Arc<BlockDispatcher>, autofix: bool) -> Self {
        LedgerGuard {
            chain,
            dispatcher,
            autofix,
            stats: parking_lot::Mutex::new(ReplayStats::default()),
        }
    }

    pub fn autofix(&self) -> bool {
        self.autofix
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats.lock().clone()
    }

    /// Replays the whole chain. `Err(ChainCorrupted)` means the node must stop.
    pub async fn resync(&self) -> Result<ResyncReport, ChainError> {
        let Some(_gate) = self.chain.state().try_enter(Gate::Sync) else {
            return Ok(ResyncReport::Skipped);
        };

        info!("Blockchain resynchronization started");
        let started = Instant::now();
        let _quiet = if self.dispatcher.is_verbose() {
            None
        } else {
            self.dispatcher.set_quiet(true);
            Some(QuietScope(&self.dispatcher))
        };

        let result = self.replay().await;

        let mut stats = self.stats.lock();
        stats.runs += 1;
        stats.last_duration = started.elapsed();
        match &result {
            Ok(ResyncReport::Replayed { blocks }) => {
                stats.blocks_replayed += blocks;
                info!("Blockchain resynchronization finished ({} blocks)", blocks);
            }
            Ok(ResyncReport::Truncated { height, .. }) => {
                stats.truncations += 1;
                info!("Blockchain resynchronization stopped at new height {}", height);
            }
            _ => {}
        }
        result
    }

    async fn replay(&self) -> Result<ResyncReport, ChainError> {
        let height = self.chain.height();
        let mut prev: Option<Block> = None;
        let mut index: u64 = 0;

        while (index as i64) <= height {
            let block = match self.chain.store().get_block(index) {
                Ok(block) => block,
                Err(e) => {
                    warn!("Failed to read block {}: {}", index, e);
                    return self.diverged(index);
                }
            };

            if let Some(prev) = &prev {
                if prev.hash != block.previous_hash {
                    error!(
                        "Link broken at block {}: previous hash {} does not match {}",
                        index, block.previous_hash, prev.hash
                    );
                    return self.diverged(index);
                }
            }

            self.dispatcher.handle_block(&block).await;
            prev = Some(block);
            index += 1;
        }

        Ok(ResyncReport::Replayed { blocks: index })
    }

    fn diverged(&self, index: u64) -> Result<ResyncReport, ChainError> {
        if !self.autofix {
            error!(
                "Saved chain corrupted in block {}. Remove the block store for resync, or run with --autofix",
                index
            );
            return Err(ChainError::ChainCorrupted { index });
        }

        info!("Autofix: Delete chain data after block {}", index);
        self.chain.truncate_from(index)?;
        let height = index as i64 - 1;
        info!("Autofix: Set new blockchain height {}", height);
        Ok(ResyncReport::Truncated {
            divergence: index,
            height,
        })
    }
}
