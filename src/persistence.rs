//! Block store layer for RelayChain
//!
//! Blocks are keyed by integer index and stored as JSON. The chain height
//! lives next to them under the `maxBlock` key.

use crate::blockchain::Block;
use crate::error::ChainError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata key holding the current chain height.
pub const MAX_BLOCK_KEY: &str = "maxBlock";

/// Abstraction for block store backends. Each call is assumed atomic.
pub trait BlockStore: Send + Sync {
    fn get_block(&self, index: u64) -> Result<Block, ChainError>;
    fn put_block(&self, block: &Block) -> Result<(), ChainError>;
    fn delete_block(&self, index: u64) -> Result<(), ChainError>;
    /// Stored height, `None` when nothing was ever written.
    fn max_block(&self) -> Result<Option<i64>, ChainError>;
    fn put_max_block(&self, height: i64) -> Result<(), ChainError>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                idx INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                body TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create metadata table: {}", e))
        })?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Number of stored block rows, whatever the recorded height says.
    pub fn block_count(&self) -> Result<u64, ChainError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to count blocks: {}", e)))?;
        Ok(count as u64)
    }
}

impl BlockStore for Database {
    fn get_block(&self, index: u64) -> Result<Block, ChainError> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM blocks WHERE idx = ?1",
                params![index as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load block: {}", e)))?;

        let body = body.ok_or(ChainError::BlockNotFound(index))?;
        serde_json::from_str(&body).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to deserialize block {}: {}", index, e))
        })
    }

    fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        let body = serde_json::to_string(block).map_err(|e| {
            ChainError::DatabaseError(format!("Failed to serialize block: {}", e))
        })?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO blocks (idx, hash, body) VALUES (?1, ?2, ?3)",
            params![block.index as i64, block.hash, body],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    fn delete_block(&self, index: u64) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM blocks WHERE idx = ?1", params![index as i64])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to delete block: {}", e)))?;
        Ok(())
    }

    fn max_block(&self) -> Result<Option<i64>, ChainError> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![MAX_BLOCK_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load height: {}", e)))?;

        value
            .map(|v| {
                v.parse::<i64>().map_err(|e| {
                    ChainError::DatabaseError(format!("Stored height is not a number: {}", e))
                })
            })
            .transpose()
    }

    fn put_max_block(&self, height: i64) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![MAX_BLOCK_KEY, height.to_string()],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save height: {}", e)))?;
        Ok(())
    }
}

/// Simple in-memory store useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub blocks: Arc<Mutex<BTreeMap<u64, Block>>>,
    pub max_block: Arc<Mutex<Option<i64>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored block in place, bypassing every check. Used to simulate corruption.
    pub fn overwrite(&self, block: Block) {
        self.blocks.lock().insert(block.index, block);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for InMemoryPersistence {
    fn get_block(&self, index: u64) -> Result<Block, ChainError> {
        self.blocks
            .lock()
            .get(&index)
            .cloned()
            .ok_or(ChainError::BlockNotFound(index))
    }

    fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        self.blocks.lock().insert(block.index, block.clone());
        Ok(())
    }

    fn delete_block(&self, index: u64) -> Result<(), ChainError> {
        self.blocks.lock().remove(&index);
        Ok(())
    }

    fn max_block(&self) -> Result<Option<i64>, ChainError> {
        Ok(*self.max_block.lock())
    }

    fn put_max_block(&self, height: i64) -> Result<(), ChainError> {
        *self.max_block.lock() = Some(height);
        Ok(())
    }
}
