// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// the block model and chain view, the shared chain state with its admission
// gates, and the stateless linkage checks.

pub mod core;
pub use core::*;
