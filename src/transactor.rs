//! Transaction tracker
//!
//! Follows a submitted block until it is buried `accept_count` blocks deep.
//! A block that disappears from the chain, or is replaced by another block at
//! the same index, is produced again up to `max_attempts` times.

use crate::blockchain::{Block, Blockchain};
use crate::consensus::ConsensusEngine;
use crate::error::ChainError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Produces a block for a payload. `None` means no block this time.
#[async_trait]
pub trait BlockGenerator: Send + Sync {
    async fn generate(&self, payload: &str) -> Option<Block>;
}

#[async_trait]
impl BlockGenerator for ConsensusEngine {
    async fn generate(&self, payload: &str) -> Option<Block> {
        match self.submit(payload).await {
            Ok(block) => block,
            Err(e) => {
                warn!("Transactor: Can't generate new block: {}", e);
                None
            }
        }
    }
}

/// Called once with the confirmed block.
pub type AcceptedCallback = Box<dyn FnOnce(Block) + Send>;

#[derive(Debug, Clone)]
pub struct TransactorConfig {
    /// Confirmation depth.
    pub accept_count: u64,
    pub max_attempts: u32,
    pub watch_interval: Duration,
    /// Pause before producing again after a failed generation.
    pub regenerate_delay: Duration,
}

impl Default for TransactorConfig {
    fn default() -> Self {
        TransactorConfig {
            accept_count: 20,
            max_attempts: 5,
            watch_interval: Duration::from_secs(5),
            regenerate_delay: Duration::from_secs(5),
        }
    }
}

struct Tracked {
    id: u64,
    payload: String,
    block: Block,
    repeats: u32,
    generator: Arc<dyn BlockGenerator>,
    on_accepted: Option<AcceptedCallback>,
}

/// What one watch pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchReport {
    pub confirmed: Vec<u64>,
    pub regenerated: Vec<u64>,
    pub failed: Vec<u64>,
    /// The pass was skipped because the ledger is being replayed.
    pub skipped: bool,
}

pub struct Transactor {
    chain: Arc<Blockchain>,
    config: TransactorConfig,
    tracked: Mutex<Vec<Tracked>>,
    next_id: AtomicU64,
}

impl Transactor {
    pub fn new(chain: Arc<Blockchain>, config: TransactorConfig) -> Self {
        Transactor {
            chain,
            config,
            tracked: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Generates a block for `payload` and starts tracking it. Returns the
    /// tracking id. Generation is retried `max_attempts` times before giving up.
    pub async fn submit(
        &self,
        payload: &str,
        generator: Arc<dyn BlockGenerator>,
        on_accepted: Option<AcceptedCallback>,
    ) -> Result<u64, ChainError> {
        info!("Transactor: Generating new block");
        let mut attempts = 0;
        let block = loop {
            if let Some(block) = generator.generate(payload).await {
                break block;
            }
            attempts += 1;
            if attempts > self.config.max_attempts {
                error!("Transactor: Block generation failed");
                return Err(ChainError::DelegationTimeout);
            }
            warn!("Transactor: Can't generate new block. Attempt generation again");
            tokio::time::sleep(self.config.regenerate_delay).await;
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!("Transactor: Block {} generated. Added to watch list", block.index);
        self.tracked.lock().push(Tracked {
            id,
            payload: payload.to_string(),
            block,
            repeats: 0,
            generator,
            on_accepted,
        });
        Ok(id)
    }

    /// Checks every tracked block once.
    pub async fn watch(&self) -> WatchReport {
        let mut report = WatchReport::default();
        if self.chain.state().is_syncing() {
            report.skipped = true;
            return report;
        }

        let entries = std::mem::take(&mut *self.tracked.lock());
        let height = self.chain.height();
        let mut keep = Vec::with_capacity(entries.len());

        for mut entry in entries {
            let index = entry.block.index;
            let still_there = match self.chain.get_block(index) {
                Ok(stored) if stored.hash == entry.block.hash => true,
                Ok(_) => {
                    warn!("Transactor: Block {} was rejected and replaced", index);
                    false
                }
                Err(_) => {
                    warn!("Transactor: Block {} was rejected", index);
                    false
                }
            };

            if !still_there {
                entry.repeats += 1;
                if entry.repeats >= self.config.max_attempts {
                    error!("Transactor: Block {} failed", index);
                    report.failed.push(entry.id);
                    continue;
                }
                if let Some(block) = entry.generator.generate(&entry.payload).await {
                    debug!("Transactor: Block {} regenerated as {}", index, block.index);
                    entry.block = block;
                }
                report.regenerated.push(entry.id);
                keep.push(entry);
                continue;
            }

            if index as i64 + self.config.accept_count as i64 <= height {
                info!("Transactor: Block {} was accepted to network", index);
                if let Some(on_accepted) = entry.on_accepted.take() {
                    on_accepted(entry.block.clone());
                }
                report.confirmed.push(entry.id);
                continue;
            }
            keep.push(entry);
        }

        // submissions that arrived during the pass are already in the list
        self.tracked.lock().extend(keep);
        report
    }

    pub fn spawn_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let transactor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(transactor.config.watch_interval);
            loop {
                ticker.tick().await;
                transactor.watch().await;
            }
        })
    }
}
