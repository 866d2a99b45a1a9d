use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::ConsensusError;
use ember_core::{Block, CoreError};

pub const MIN_DIFFICULTY: u32 = 1;

/// Blocks required before the difficulty may move.
pub const DIFFICULTY_WINDOW: usize = 10;

// The nonce search only looks at the cancel flag on this stride, keeping
// the hot loop branch-light while still stopping promptly.
const CANCEL_POLL_STRIDE: u64 = 65_536;

/// Leading-zero-hex proof of work with a single-step difficulty adapter.
pub struct ProofOfWork {
    difficulty: RwLock<u32>,
    target_block_time: Duration,
}

impl ProofOfWork {
    pub fn new(difficulty: u32, target_block_time: Duration) -> Self {
        Self {
            difficulty: RwLock::new(difficulty.max(MIN_DIFFICULTY)),
            target_block_time,
        }
    }

    pub fn difficulty(&self) -> u32 {
        *self.difficulty.read()
    }

    /// Searches nonces until the block hash carries the required zero
    /// prefix. Cooperatively cancellable through `cancel`.
    pub fn mine(&self, block: &mut Block, cancel: &AtomicBool) -> Result<(), ConsensusError> {
        let target = "0".repeat(block.difficulty.max(MIN_DIFFICULTY) as usize);
        loop {
            block.set_hash();
            if block.hash.starts_with(&target) {
                return Ok(());
            }
            block.nonce = block.nonce.wrapping_add(1);
            if block.nonce % CANCEL_POLL_STRIDE == 0 && cancel.load(Ordering::Relaxed) {
                return Err(ConsensusError::Cancelled);
            }
        }
    }

    /// Consensus acceptance: the recorded hash must match the header and
    /// carry the block's own difficulty worth of leading zeros.
    pub fn validate_block(&self, block: &Block) -> Result<(), ConsensusError> {
        if block.hash != block.compute_hash() {
            return Err(CoreError::InvalidBlock(format!(
                "recorded hash does not match header at height {}",
                block.index
            ))
            .into());
        }
        let required = block.difficulty.max(MIN_DIFFICULTY) as usize;
        if !block.hash.starts_with(&"0".repeat(required)) {
            return Err(CoreError::InvalidBlock(format!(
                "hash does not meet difficulty {required} at height {}",
                block.index
            ))
            .into());
        }
        Ok(())
    }

    /// Nudges the difficulty one step based on the mean inter-block
    /// interval of `recent`. Needs a full window of blocks; returns the
    /// difficulty in force afterwards.
    pub fn adjust_difficulty(&self, recent: &[Block]) -> u32 {
        if recent.len() < DIFFICULTY_WINDOW {
            return self.difficulty();
        }
        let total_ms: i64 = recent
            .windows(2)
            .map(|pair| {
                (pair[1].timestamp - pair[0].timestamp)
                    .num_milliseconds()
                    .max(0)
            })
            .sum();
        let mean_ms = total_ms / (recent.len() as i64 - 1);
        let target_ms = self.target_block_time.as_millis() as i64;

        let mut difficulty = self.difficulty.write();
        if mean_ms < target_ms / 2 {
            *difficulty += 1;
            info!(difficulty = *difficulty, mean_ms, "difficulty raised");
        } else if mean_ms > target_ms * 2 && *difficulty > MIN_DIFFICULTY {
            *difficulty -= 1;
            info!(difficulty = *difficulty, mean_ms, "difficulty lowered");
        }
        *difficulty
    }
}
