use crate::error::ChainError;

use super::chain::Block;

/// `new` must sit directly on top of `prev`: next index and matching previous hash.
pub fn validate_linkage(new: &Block, prev: &Block) -> Result<(), ChainError> {
    if new.index != prev.index + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            prev.index + 1,
            new.index
        )));
    }
    if new.previous_hash != prev.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid previous block hash in block {}. Expected {}, but got {}.",
            new.index, prev.hash, new.previous_hash
        )));
    }
    Ok(())
}

/// The stored hash must equal the hash recomputed from the block's fields.
pub fn validate_hash(block: &Block) -> Result<(), ChainError> {
    let expected = block.compute_hash();
    if expected != block.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Hash mismatch in block {}. Expected {}, but got {}.",
            block.index, expected, block.hash
        )));
    }
    Ok(())
}

/// Millisecond timestamps are exactly 13 decimal digits wide.
pub fn is_fixed_width_millis(timestamp: i64) -> bool {
    (1_000_000_000_000..=9_999_999_999_999).contains(&timestamp)
}
