//! Block dispatch: interprets the payload of every accepted or replayed block
//!
//! Keyring and heartbeat payloads are handled here. Everything else goes to
//! handlers registered per payload type. A failing handler never stops the
//! dispatch of later blocks.

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::keyring::{Keyring, KeyringFile};
use crate::payload::{Payload, Signable};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default last block index (exclusive) at which a keyring may still be emitted.
pub const KEY_EMISSION_MAX_BLOCK: u64 = 5;

/// Externally contributed handler for one payload type.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle(&self, payload: &Signable, block: &Block) -> Result<(), ChainError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// `data` is not a JSON payload.
    NotData,
    KeyringInstalled,
    /// Late or duplicate keyring, dropped as a forgery attempt.
    KeyringRejected,
    Heartbeat,
    /// Number of registered handlers that ran.
    Handled(usize),
    Unhandled,
    HandlerFailed(String),
}

pub struct BlockDispatcher {
    keyring: RwLock<Vec<String>>,
    keyring_file: Option<KeyringFile>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn BlockHandler>>>>,
    key_emission_max_block: u64,
    local_key: String,
    verbose: bool,
    quiet: AtomicBool,
}

impl BlockDispatcher {
    /// `local_key` is this node's public key, used for the trusted node notice.
    pub fn new(local_key: String, keyring_file: Option<KeyringFile>, verbose: bool) -> Self {
        let keyring = keyring_file.as_ref().map(KeyringFile::load).unwrap_or_default();
        if !keyring.is_empty() {
            info!("Loaded keyring with {} keys", keyring.len());
        }
        BlockDispatcher {
            keyring: RwLock::new(keyring),
            keyring_file,
            handlers: RwLock::new(HashMap::new()),
            key_emission_max_block: KEY_EMISSION_MAX_BLOCK,
            local_key,
            verbose,
            quiet: AtomicBool::new(false),
        }
    }

    pub fn with_key_emission_max_block(mut self, index: u64) -> Self {
        self.key_emission_max_block = index;
        self
    }

    pub fn key_emission_max_block(&self) -> u64 {
        self.key_emission_max_block
    }

    pub fn register_handler(&self, kind: &str, handler: Arc<dyn BlockHandler>) {
        self.handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push(handler);
    }

    pub fn keyring(&self) -> Vec<String> {
        self.keyring.read().clone()
    }

    pub fn has_keyring(&self) -> bool {
        !self.keyring.read().is_empty()
    }

    pub fn is_key_from_keyring(&self, public_key: &str) -> bool {
        self.keyring.read().iter().any(|k| k == public_key)
    }

    pub fn local_key(&self) -> &str {
        &self.local_key
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Silences per-block notices, used while the ledger is replayed.
    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::SeqCst);
    }

    fn note(&self, message: &str) {
        if self.quiet.load(Ordering::SeqCst) {
            debug!("{}", message);
        } else {
            info!("{}", message);
        }
    }

    pub async fn handle_block(&self, block: &Block) -> DispatchOutcome {
        let signable = match Signable::parse(&block.data) {
            Ok(signable) => signable,
            Err(_) => {
                self.note(&format!("Not JSON block {}", block.index));
                return DispatchOutcome::NotData;
            }
        };

        if block.index == self.key_emission_max_block {
            if !self.has_keyring() {
                warn!("Network without keyring");
            }
            if self.is_key_from_keyring(&self.local_key) {
                warn!("TRUSTED NODE. BE CAREFUL.");
            }
        }

        let payload = match Payload::classify(&signable) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Malformed {} payload in block {}: {}", signable.kind, block.index, e);
                return DispatchOutcome::HandlerFailed(e.to_string());
            }
        };

        match payload {
            Payload::Keyring(keyring) => self.install_keyring(keyring, block.index),
            Payload::Empty => DispatchOutcome::Heartbeat,
            _ => self.run_handlers(&signable, block).await,
        }
    }

    fn install_keyring(&self, keyring: Keyring, index: u64) -> DispatchOutcome {
        let mut installed = self.keyring.write();
        if index >= self.key_emission_max_block || !installed.is_empty() {
            warn!("Fake keyring in block {}", index);
            return DispatchOutcome::KeyringRejected;
        }
        self.note(&format!("Keyring received in block {}", index));
        *installed = keyring.keys;
        if let Some(file) = &self.keyring_file {
            if let Err(e) = file.save(&installed) {
                error!("Failed to persist keyring: {}", e);
            }
        }
        DispatchOutcome::KeyringInstalled
    }

    async fn run_handlers(&self, signable: &Signable, block: &Block) -> DispatchOutcome {
        let registered = self.handlers.read().get(&signable.kind).cloned();
        let handlers = match registered {
            Some(handlers) => handlers,
            None => {
                if self.verbose {
                    self.note(&format!(
                        "Unexpected block type {} in block {}",
                        signable.kind, block.index
                    ));
                }
                return DispatchOutcome::Unhandled;
            }
        };

        for handler in &handlers {
            if let Err(e) = handler.handle(signable, block).await {
                error!("Handler for {} failed on block {}: {}", signable.kind, block.index, e);
                return DispatchOutcome::HandlerFailed(e.to_string());
            }
        }
        DispatchOutcome::Handled(handlers.len())
    }
}
