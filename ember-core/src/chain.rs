use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::block::{Block, GenesisParams, BLOCK_REWARD};
use crate::error::{CoreError, Result};
use crate::transaction::Transaction;
use crate::utxo::UtxoSet;
use ember_storage::{ArchiveError, BlockArchive};

/// In-memory ordered chain with archive-backed durability. Appends are
/// serialised by the write lock, which is held for the whole
/// validate-apply-persist sequence; the UTXO lock is only ever taken while
/// the chain lock is held, never the other way round.
pub struct ChainStore {
    blocks: RwLock<Vec<Block>>,
    archive: Arc<dyn BlockArchive>,
    genesis: GenesisParams,
}

impl ChainStore {
    pub fn new(archive: Arc<dyn BlockArchive>, genesis: GenesisParams) -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            archive,
            genesis,
        }
    }

    /// Loads the persisted chain if the archive has one, otherwise
    /// materialises the genesis block. Either way the UTXO set ends up
    /// reflecting the loaded blocks. Idempotent.
    pub fn initialize(&self, utxos: &UtxoSet) -> Result<()> {
        let mut blocks = self.blocks.write();
        if !blocks.is_empty() {
            return Ok(());
        }
        match self.archive.height()? {
            Some(persisted) => {
                let mut loaded = Vec::with_capacity(persisted as usize + 1);
                for index in 0..=persisted {
                    let bytes = self
                        .archive
                        .block_by_index(index)?
                        .ok_or_else(|| ArchiveError::Corrupt(format!("block:index:{index}")))?;
                    let block: Block = serde_json::from_slice(&bytes)
                        .map_err(|e| CoreError::Serialization(e.to_string()))?;
                    loaded.push(block);
                }
                utxos.rebuild(&loaded)?;
                info!(height = persisted, "loaded chain from archive");
                *blocks = loaded;
            }
            None => {
                let genesis = Block::genesis(&self.genesis);
                let bytes = serde_json::to_vec(&genesis)
                    .map_err(|e| CoreError::Serialization(e.to_string()))?;
                self.archive.save_block(0, &genesis.hash, &bytes)?;
                utxos.update(&genesis)?;
                info!(hash = %genesis.hash, "materialised genesis block");
                blocks.push(genesis);
            }
        }
        Ok(())
    }

    /// Full acceptance check against the current tip. Proof-of-work is the
    /// consensus layer's concern and must have been checked already.
    pub fn validate_block(&self, block: &Block) -> Result<()> {
        let blocks = self.blocks.read();
        let tip = blocks
            .last()
            .ok_or_else(|| CoreError::InvalidBlock("chain not initialised".into()))?;
        Self::validate_against(tip, block)
    }

    /// Validates, applies to the UTXO set, appends and persists, all under
    /// the chain write lock. A UTXO failure for a block that passed full
    /// validation surfaces as `ConsensusInvariantViolated` with the chain
    /// left untouched. An archive failure is surfaced too, but the block
    /// stays appended in memory.
    pub fn add_block(&self, block: Block, utxos: &UtxoSet) -> Result<()> {
        let mut blocks = self.blocks.write();
        let tip = blocks
            .last()
            .ok_or_else(|| CoreError::InvalidBlock("chain not initialised".into()))?;
        Self::validate_against(tip, &block)?;
        let bytes = serde_json::to_vec(&block)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        utxos.update(&block).map_err(|e| {
            CoreError::ConsensusInvariantViolated(format!(
                "validated block {} failed to apply: {e}",
                block.hash
            ))
        })?;
        let index = block.index;
        let hash = block.hash.clone();
        blocks.push(block);
        if let Err(e) = self.archive.save_block(index, &hash, &bytes) {
            warn!(height = index, "block kept in memory but not persisted: {e}");
            return Err(e.into());
        }
        info!(height = index, hash = %hash, "appended block");
        Ok(())
    }

    pub fn block_at(&self, height: u64) -> Option<Block> {
        self.blocks.read().get(height as usize).cloned()
    }

    // Linear scan; fine at this chain's scale.
    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        self.blocks.read().iter().find(|b| b.hash == hash).cloned()
    }

    pub fn blocks_range(&self, start: u64, limit: usize) -> Vec<Block> {
        self.blocks
            .read()
            .iter()
            .skip(start as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest_block(&self) -> Option<Block> {
        self.blocks.read().last().cloned()
    }

    pub fn height(&self) -> u64 {
        self.blocks.read().len().saturating_sub(1) as u64
    }

    /// Looks a committed transaction up by id, returning it with the
    /// containing block's height and hash.
    pub fn find_transaction(&self, id: &str) -> Option<(Transaction, u64, String)> {
        let blocks = self.blocks.read();
        for block in blocks.iter() {
            if let Some(tx) = block.transactions.iter().find(|tx| tx.id == id) {
                return Some((tx.clone(), block.index, block.hash.clone()));
            }
        }
        None
    }

    fn validate_against(tip: &Block, block: &Block) -> Result<()> {
        if block.index != tip.index + 1 {
            return Err(CoreError::InvalidBlock(format!(
                "expected height {}, got {}",
                tip.index + 1,
                block.index
            )));
        }
        if block.previous_hash != tip.hash {
            return Err(CoreError::InvalidBlock(format!(
                "previous hash does not match tip at height {}",
                block.index
            )));
        }
        block.validate()?;
        Self::check_reward(block)?;
        for tx in &block.transactions {
            tx.verify_signature()?;
        }
        Ok(())
    }

    // One coinbase, first in the block, minting exactly reward + fees.
    fn check_reward(block: &Block) -> Result<()> {
        let coinbase = match block.transactions.first() {
            Some(tx) if tx.is_coinbase() => tx,
            _ => {
                return Err(CoreError::InvalidBlock(
                    "block is missing its coinbase transaction".into(),
                ))
            }
        };
        let expected = BLOCK_REWARD + block.fee_total();
        if coinbase.amount != expected {
            return Err(CoreError::InvalidBlock(format!(
                "coinbase mints {}, expected {expected}",
                coinbase.amount
            )));
        }
        Ok(())
    }
}
