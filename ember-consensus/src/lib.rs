pub mod miner;
pub mod pow;

pub use miner::{Miner, MAX_BLOCK_TRANSACTIONS};
pub use pow::{ProofOfWork, DIFFICULTY_WINDOW, MIN_DIFFICULTY};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("mining cancelled")]
    Cancelled,
    #[error("mining task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Core(#[from] ember_core::CoreError),
}
