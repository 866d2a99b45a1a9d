use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{CoreError, Result};
use crate::transaction::Transaction;

/// Pending transactions keyed by id. Admission checks (signature, balance
/// feasibility) are the caller's responsibility; the pool only enforces
/// uniqueness and fee-priority ordering.
#[derive(Default)]
pub struct Mempool {
    transactions: RwLock<HashMap<String, Transaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&self, tx: Transaction) -> Result<()> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&tx.id) {
            return Err(CoreError::DuplicateTransaction(tx.id));
        }
        transactions.insert(tx.id.clone(), tx);
        Ok(())
    }

    pub fn remove_transaction(&self, id: &str) -> Option<Transaction> {
        self.transactions.write().remove(id)
    }

    pub fn get_transaction(&self, id: &str) -> Option<Transaction> {
        self.transactions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transactions.read().contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn clear(&self) {
        self.transactions.write().clear();
    }

    /// Up to `limit` transactions in non-increasing fee order. The sort is
    /// stable, so equal fees keep one consistent order per call.
    pub fn by_fee(&self, limit: usize) -> Vec<Transaction> {
        let mut out: Vec<Transaction> = self.transactions.read().values().cloned().collect();
        out.sort_by(|a, b| b.fee.cmp(&a.fee));
        out.truncate(limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_crypto::{generate_keypair, sign_digest};

    fn signed_with_fee(fee: u64) -> Transaction {
        let from = generate_keypair();
        let to = generate_keypair();
        let mut tx = Transaction::new(&from.address, &to.address, 10, fee);
        let sig = sign_digest(&from.private_key, &tx.signing_payload()).unwrap();
        tx.attach_signature(sig);
        tx
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let pool = Mempool::new();
        let tx = signed_with_fee(1);
        pool.add_transaction(tx.clone()).unwrap();
        assert!(matches!(
            pool.add_transaction(tx),
            Err(CoreError::DuplicateTransaction(_))
        ));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn by_fee_orders_descending() {
        let pool = Mempool::new();
        for fee in [5u64, 50, 1, 20] {
            pool.add_transaction(signed_with_fee(fee)).unwrap();
        }
        let fees: Vec<u64> = pool.by_fee(10).iter().map(|tx| tx.fee).collect();
        assert_eq!(fees, vec![50, 20, 5, 1]);
    }

    #[test]
    fn by_fee_respects_limit() {
        let pool = Mempool::new();
        for fee in 1..=5u64 {
            pool.add_transaction(signed_with_fee(fee)).unwrap();
        }
        let top = pool.by_fee(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].fee, 5);
        assert_eq!(top[1].fee, 4);
    }

    #[test]
    fn remove_and_clear() {
        let pool = Mempool::new();
        let tx = signed_with_fee(1);
        let id = tx.id.clone();
        pool.add_transaction(tx).unwrap();
        assert!(pool.get_transaction(&id).is_some());
        assert!(pool.remove_transaction(&id).is_some());
        assert!(pool.remove_transaction(&id).is_none());
        pool.add_transaction(signed_with_fee(2)).unwrap();
        pool.clear();
        assert_eq!(pool.size(), 0);
    }
}
