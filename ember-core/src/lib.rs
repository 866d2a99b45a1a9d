pub mod block;
pub mod chain;
pub mod error;
pub mod mempool;
pub mod merkle;
pub mod transaction;
pub mod utxo;

pub use block::{Block, GenesisParams, BLOCK_REWARD, GENESIS_ADDRESS, GENESIS_SUPPLY};
pub use chain::ChainStore;
pub use error::{CoreError, Result};
pub use mempool::Mempool;
pub use transaction::{Transaction, COINBASE_SIGNATURE};
pub use utxo::{OutPoint, Utxo, UtxoSet};
