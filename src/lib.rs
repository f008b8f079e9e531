//! RelayChain - a permissioned blockchain node with pluggable consensus
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Block model, chain view and admission gates
//! - [`payload`] - Signable block payloads and their kinds
//! - [`dispatch`] - Routing committed blocks to payload handlers
//! - [`sync`] - Ledger replay and repair
//!
//! ## Consensus
//! - [`consensus`] - Validator engine with LCPoA, PoS and Thrusted Nodes
//! - [`transactor`] - Tracking submitted blocks until confirmation
//!
//! ## Cryptography
//! - [`crypto`] - Signatures and verification (secp256k1)
//! - [`keyring`] - Trusted key set and its emission
//!
//! ## State Management
//! - [`persistence`] - Block store (SQLite and in-memory)
//! - [`cache`] - Caching utilities
//!
//! ## Networking
//! - [`network`] - Gossip relay over WebSocket peers
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`node`] - Node runner wiring everything together
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod dispatch;
pub mod payload;
pub mod sync;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;
pub mod transactor;

// ============================================================================
// Cryptography & Security
// ============================================================================
pub mod crypto;
pub mod keyring;

// ============================================================================
// State Management
// ============================================================================
pub mod cache;
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
