use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which admission gate a guard holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Ledger replay is running.
    Sync,
    /// A block announced by a peer is being applied (`ConsensusEngine::accept_announced`).
    ChainResponse,
}

/// Process-wide chain state.
///
/// `max_block` only moves forward through successful block acceptance (or
/// backward through ledger repair). While either gate is held, consensus
/// handlers that would touch the chain must defer.
#[derive(Debug)]
pub struct ChainState {
    max_block: AtomicI64,
    sync_in_progress: AtomicBool,
    chain_response_mutex: AtomicBool,
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainState {
    pub fn new() -> Self {
        Self {
            max_block: AtomicI64::new(-1),
            sync_in_progress: AtomicBool::new(false),
            chain_response_mutex: AtomicBool::new(false),
        }
    }

    pub fn max_block(&self) -> i64 {
        self.max_block.load(Ordering::SeqCst)
    }

    pub fn set_max_block(&self, height: i64) {
        self.max_block.store(height, Ordering::SeqCst);
    }

    /// Raises the height, never lowers it.
    pub fn advance_to(&self, height: i64) {
        self.max_block.fetch_max(height, Ordering::SeqCst);
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_in_progress.load(Ordering::SeqCst)
    }

    pub fn is_responding(&self) -> bool {
        self.chain_response_mutex.load(Ordering::SeqCst)
    }

    /// True when neither gate is held.
    pub fn is_open(&self) -> bool {
        !self.is_syncing() && !self.is_responding()
    }

    fn flag(&self, gate: Gate) -> &AtomicBool {
        match gate {
            Gate::Sync => &self.sync_in_progress,
            Gate::ChainResponse => &self.chain_response_mutex,
        }
    }

    /// Takes `gate` if nobody holds it. The gate is released when the guard drops.
    pub fn try_enter(self: &Arc<Self>, gate: Gate) -> Option<GateGuard> {
        self.flag(gate)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GateGuard {
                state: Arc::clone(self),
                gate,
            })
    }

    /// Polls until both gates are free.
    pub async fn wait_open(&self, backoff: Duration) {
        while !self.is_open() {
            tokio::time::sleep(backoff).await;
        }
    }

    /// Like [`wait_open`](Self::wait_open) but gives up after `max_wait`.
    pub async fn wait_open_for(&self, backoff: Duration, max_wait: Duration) -> bool {
        tokio::time::timeout(max_wait, self.wait_open(backoff))
            .await
            .is_ok()
    }
}

/// Holds one admission gate; releases it on drop.
#[derive(Debug)]
pub struct GateGuard {
    state: Arc<ChainState>,
    gate: Gate,
}

impl GateGuard {
    pub fn gate(&self) -> Gate {
        self.gate
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.state.flag(self.gate).store(false, Ordering::SeqCst);
    }
}
