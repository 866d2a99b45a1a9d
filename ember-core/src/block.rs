use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::merkle;
use crate::transaction::Transaction;
use ember_crypto::sha256_hex;

/// Fixed subsidy minted by every mined block's coinbase.
pub const BLOCK_REWARD: u64 = 50;

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Pre-funded genesis address: the hex encoding of the secp256k1 generator
/// point, i.e. the public key of the well-known secret key 1.
pub const GENESIS_ADDRESS: &str = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";

/// Initial supply minted to the genesis address.
pub const GENESIS_SUPPLY: u64 = 1_000_000;

/// Parameters that pin down the deterministic genesis block. Tests swap in
/// their own pre-funded address here.
#[derive(Debug, Clone)]
pub struct GenesisParams {
    pub address: String,
    pub supply: u64,
}

impl Default for GenesisParams {
    fn default() -> Self {
        Self {
            address: GENESIS_ADDRESS.to_string(),
            supply: GENESIS_SUPPLY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub hash: String,
    pub difficulty: u32,
}

impl Block {
    /// Builds an unmined candidate: merkle root computed, nonce zero, hash
    /// left empty for the proof-of-work search to fill.
    pub fn new(
        index: u64,
        previous_hash: &str,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let ids: Vec<String> = transactions.iter().map(|tx| tx.id.clone()).collect();
        Self {
            index,
            timestamp: Utc::now(),
            transactions,
            nonce: 0,
            previous_hash: previous_hash.to_string(),
            merkle_root: merkle::merkle_root(&ids),
            hash: String::new(),
            difficulty: difficulty.max(1),
        }
    }

    /// The deterministic first block: epoch timestamp, one coinbase minting
    /// the initial supply, nonce 0, difficulty 1.
    pub fn genesis(params: &GenesisParams) -> Self {
        let timestamp = DateTime::UNIX_EPOCH;
        let coinbase = Transaction::coinbase_at(&params.address, params.supply, timestamp);
        let merkle_root = merkle::merkle_root(std::slice::from_ref(&coinbase.id));
        let mut block = Self {
            index: 0,
            timestamp,
            transactions: vec![coinbase],
            nonce: 0,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            merkle_root,
            hash: String::new(),
            difficulty: 1,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn timestamp_rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// Header commitment: index || timestamp || merkle_root ||
    /// previous_hash || nonce || difficulty, integers in decimal.
    pub fn compute_hash(&self) -> String {
        let payload = format!(
            "{}{}{}{}{}{}",
            self.index,
            self.timestamp_rfc3339(),
            self.merkle_root,
            self.previous_hash,
            self.nonce,
            self.difficulty
        );
        sha256_hex(payload.as_bytes())
    }

    pub fn set_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    pub fn transaction_ids(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.id.clone()).collect()
    }

    /// Self-consistency: hash integrity, merkle integrity, coinbase
    /// placement and per-transaction validity. Contextual checks (tip
    /// linkage, proof-of-work) live with the chain and consensus layers.
    pub fn validate(&self) -> Result<()> {
        if self.index == 0 && self.previous_hash != GENESIS_PREVIOUS_HASH {
            return Err(CoreError::InvalidBlock(
                "genesis previous hash must be \"0\"".into(),
            ));
        }
        if self.hash.is_empty() {
            return Err(CoreError::InvalidBlock("block hash is empty".into()));
        }
        if self.hash != self.compute_hash() {
            return Err(CoreError::InvalidBlock(format!(
                "hash mismatch at height {}",
                self.index
            )));
        }
        if self.merkle_root != merkle::merkle_root(&self.transaction_ids()) {
            return Err(CoreError::InvalidBlock(format!(
                "merkle root mismatch at height {}",
                self.index
            )));
        }
        for (i, tx) in self.transactions.iter().enumerate() {
            if tx.is_coinbase() && i > 0 {
                return Err(CoreError::InvalidBlock(
                    "coinbase transaction must come first".into(),
                ));
            }
            tx.validate()?;
        }
        Ok(())
    }

    /// Total fees carried by the non-coinbase transactions.
    pub fn fee_total(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.fee)
            .sum()
    }
}
