use thiserror::Error;

use ember_storage::ArchiveError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(String),
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error("serialization: {0}")]
    Serialization(String),
    /// A block passed full validation but could not be applied. The ledger
    /// would diverge if the caller carried on, so this is fatal.
    #[error("consensus invariant violated: {0}")]
    ConsensusInvariantViolated(String),
}
