use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::error::{CoreError, Result};
use crate::transaction::Transaction;

/// Identifies one output of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: String,
    pub output_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub tx_id: String,
    pub output_index: u32,
    pub address: String,
    pub amount: u64,
}

/// Authoritative unspent-output state. A `BTreeMap` keeps enumeration
/// order stable, which makes greedy input selection deterministic.
///
/// All operations serialise under the single lock. Callers must not hold
/// it across chain-level calls; internal writers go through
/// `apply_locked` on the already-held guard so replay can never re-enter
/// the lock.
#[derive(Default)]
pub struct UtxoSet {
    utxos: RwLock<BTreeMap<OutPoint, Utxo>>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spends the sender's outputs and creates the recipient (and change)
    /// outputs for one transaction.
    pub fn apply_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut utxos = self.utxos.write();
        Self::apply_locked(&mut utxos, tx)
    }

    /// Applies every transaction of a block in order under one write lock.
    /// The block is validated before it gets here; a failure mid-block is
    /// an invariant violation the caller must treat as fatal.
    pub fn update(&self, block: &Block) -> Result<()> {
        let mut utxos = self.utxos.write();
        for tx in &block.transactions {
            Self::apply_locked(&mut utxos, tx)?;
        }
        Ok(())
    }

    /// Cheap admission precheck: does the sender's summed balance cover
    /// `amount + fee`? The authoritative check happens on apply.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let required = spend_total(tx)?;
        let available = self.balance(&tx.from);
        if available < required {
            return Err(CoreError::InsufficientBalance {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Drops the whole set and replays every block in height order. Used
    /// at startup against the persisted chain.
    pub fn rebuild(&self, blocks: &[Block]) -> Result<()> {
        let mut utxos = self.utxos.write();
        utxos.clear();
        for block in blocks {
            for tx in &block.transactions {
                Self::apply_locked(&mut utxos, tx)?;
            }
        }
        Ok(())
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.utxos
            .read()
            .values()
            .filter(|u| u.address == address)
            .map(|u| u.amount)
            .sum()
    }

    pub fn utxos_for(&self, address: &str) -> Vec<Utxo> {
        self.utxos
            .read()
            .values()
            .filter(|u| u.address == address)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.utxos.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.read().is_empty()
    }

    fn apply_locked(utxos: &mut BTreeMap<OutPoint, Utxo>, tx: &Transaction) -> Result<()> {
        if tx.is_coinbase() {
            insert_output(utxos, &tx.id, 0, &tx.to, tx.amount);
            return Ok(());
        }

        let required = spend_total(tx)?;
        let mut selected: Vec<OutPoint> = Vec::new();
        let mut total = 0u64;
        for (outpoint, utxo) in utxos.iter() {
            if utxo.address != tx.from {
                continue;
            }
            total = total
                .checked_add(utxo.amount)
                .ok_or_else(|| CoreError::InvalidInput("input total overflows".into()))?;
            selected.push(outpoint.clone());
            if total >= required {
                break;
            }
        }
        if total < required {
            return Err(CoreError::InsufficientBalance {
                required,
                available: total,
            });
        }

        for outpoint in &selected {
            utxos.remove(outpoint);
        }
        insert_output(utxos, &tx.id, 0, &tx.to, tx.amount);
        if total > required {
            insert_output(utxos, &tx.id, 1, &tx.from, total - required);
        }
        Ok(())
    }
}

fn spend_total(tx: &Transaction) -> Result<u64> {
    tx.amount
        .checked_add(tx.fee)
        .ok_or_else(|| CoreError::InvalidInput("amount + fee overflows".into()))
}

fn insert_output(
    utxos: &mut BTreeMap<OutPoint, Utxo>,
    tx_id: &str,
    output_index: u32,
    address: &str,
    amount: u64,
) {
    utxos.insert(
        OutPoint {
            tx_id: tx_id.to_string(),
            output_index,
        },
        Utxo {
            tx_id: tx_id.to_string(),
            output_index,
            address: address.to_string(),
            amount,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::GenesisParams;
    use ember_crypto::{generate_keypair, sign_digest, Keypair};

    fn signed(from: &Keypair, to: &str, amount: u64, fee: u64) -> Transaction {
        let mut tx = Transaction::new(&from.address, to, amount, fee);
        let sig = sign_digest(&from.private_key, &tx.signing_payload()).unwrap();
        tx.attach_signature(sig);
        tx
    }

    fn funded(address: &str, amount: u64) -> (UtxoSet, Transaction) {
        let set = UtxoSet::new();
        let mint = Transaction::coinbase(address, amount);
        set.apply_transaction(&mint).unwrap();
        (set, mint)
    }

    #[test]
    fn coinbase_creates_single_output() {
        let miner = generate_keypair();
        let (set, mint) = funded(&miner.address, 50);
        assert_eq!(set.len(), 1);
        assert_eq!(set.balance(&miner.address), 50);
        let utxos = set.utxos_for(&miner.address);
        assert_eq!(utxos[0].tx_id, mint.id);
        assert_eq!(utxos[0].output_index, 0);
    }

    #[test]
    fn transfer_with_change() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let (set, _) = funded(&alice.address, 1000);
        let tx = signed(&alice, &bob.address, 100, 10);
        set.apply_transaction(&tx).unwrap();
        assert_eq!(set.balance(&bob.address), 100);
        assert_eq!(set.balance(&alice.address), 890);
        let change = set.utxos_for(&alice.address);
        assert_eq!(change.len(), 1);
        assert_eq!(change[0].output_index, 1);
    }

    #[test]
    fn exact_spend_creates_no_change() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let (set, _) = funded(&alice.address, 110);
        let tx = signed(&alice, &bob.address, 100, 10);
        set.apply_transaction(&tx).unwrap();
        assert_eq!(set.balance(&alice.address), 0);
        assert!(set.utxos_for(&alice.address).is_empty());
    }

    #[test]
    fn short_by_one_unit_is_rejected() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let (set, _) = funded(&alice.address, 109);
        let tx = signed(&alice, &bob.address, 100, 10);
        let err = set.apply_transaction(&tx).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InsufficientBalance {
                required: 110,
                available: 109
            }
        ));
        // failed apply must not consume anything
        assert_eq!(set.balance(&alice.address), 109);
    }

    #[test]
    fn precheck_matches_apply() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let (set, _) = funded(&alice.address, 109);
        let tx = signed(&alice, &bob.address, 100, 10);
        assert!(set.validate_transaction(&tx).is_err());
        let (set, _) = funded(&alice.address, 110);
        assert!(set.validate_transaction(&tx).is_ok());
    }

    #[test]
    fn greedy_selection_merges_small_outputs() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let set = UtxoSet::new();
        let base = chrono::Utc::now();
        for i in 0..3 {
            let mint = Transaction::coinbase_at(
                &alice.address,
                40,
                base + chrono::Duration::nanoseconds(i),
            );
            set.apply_transaction(&mint).unwrap();
        }
        let tx = signed(&alice, &bob.address, 100, 10);
        set.apply_transaction(&tx).unwrap();
        assert_eq!(set.balance(&bob.address), 100);
        assert_eq!(set.balance(&alice.address), 10);
    }

    #[test]
    fn rebuild_replays_chain_state() {
        let set = UtxoSet::new();
        let params = GenesisParams::default();
        let genesis = Block::genesis(&params);
        set.rebuild(std::slice::from_ref(&genesis)).unwrap();
        assert_eq!(set.balance(&params.address), params.supply);
        // rebuilding again must not double-count
        set.rebuild(std::slice::from_ref(&genesis)).unwrap();
        assert_eq!(set.balance(&params.address), params.supply);
    }
}
