//! Pending transaction pool
//!
//! Transactions are kept in arrival order; the next block is assembled from a
//! snapshot of that order so block contents are deterministic for a given pool.

use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::HashSet;

pub type TxHash = [u8; 32];

/// Default pool capacity
pub const DEFAULT_MAX_PENDING: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Mempool {
    /// Pending transactions in FIFO order (arrival time ordering).
    pending: Vec<Transaction>,
    /// Hashes of pending transactions for deduplication.
    seen: HashSet<TxHash>,
    max_pending: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Mempool {
            pending: Vec::new(),
            seen: HashSet::new(),
            max_pending,
        }
    }

    /// Appends a transaction that has already passed signature verification.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<TxHash, ChainError> {
        let hash = tx.hash();
        if self.seen.contains(&hash) {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction {} is already pending",
                hex::encode(hash)
            )));
        }
        if self.pending.len() >= self.max_pending {
            return Err(ChainError::InvalidTransaction("Mempool is full".to_string()));
        }

        self.seen.insert(hash);
        self.pending.push(tx);
        Ok(hash)
    }

    /// Copy of the pool in insertion order.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.pending.clone()
    }

    /// Removes exactly the given transactions; anything else stays pending.
    pub fn remove_transactions(&mut self, hashes: &HashSet<TxHash>) -> usize {
        let before = self.pending.len();
        self.pending.retain(|tx| !hashes.contains(&tx.hash()));
        for hash in hashes {
            self.seen.remove(hash);
        }
        before - self.pending.len()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.seen.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_keypair, Scheme};

    fn tx(nonce: u64) -> Transaction {
        let alice = generate_keypair(Scheme::Ed25519).unwrap();
        let bob = generate_keypair(Scheme::Ed25519).unwrap();
        let mut tx = Transaction::new(alice.public.clone(), bob.public.clone(), 1, nonce);
        tx.sign(&alice.secret).unwrap();
        tx
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut pool = Mempool::new();
        let txs: Vec<_> = (0..5).map(tx).collect();
        for t in &txs {
            pool.add_transaction(t.clone()).unwrap();
        }
        let snapshot = pool.snapshot();
        let nonces: Vec<u64> = snapshot.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut pool = Mempool::new();
        let t = tx(1);
        pool.add_transaction(t.clone()).unwrap();
        assert!(pool.add_transaction(t).is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let mut pool = Mempool::with_capacity(1);
        pool.add_transaction(tx(1)).unwrap();
        let err = pool.add_transaction(tx(2)).unwrap_err();
        assert!(err.to_string().contains("full"));
    }

    #[test]
    fn test_remove_only_included() {
        let mut pool = Mempool::new();
        let a = tx(1);
        let b = tx(2);
        let c = tx(3);
        for t in [&a, &b, &c] {
            pool.add_transaction(t.clone()).unwrap();
        }

        let included: HashSet<TxHash> = [a.hash(), b.hash()].into_iter().collect();
        assert_eq!(pool.remove_transactions(&included), 2);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&c.hash()));
        assert!(!pool.contains(&a.hash()));

        // A removed transaction can be resubmitted; the ledger's nonce check guards replays.
        assert!(pool.add_transaction(a).is_ok());
    }
}
