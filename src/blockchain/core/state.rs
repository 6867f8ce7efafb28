use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::HashMap;

use super::chain::Block;

/// Highest confirmed nonce per sender address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceIndex {
    confirmed: HashMap<String, u64>,
}

impl NonceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_confirmed(&self, sender: &str) -> Option<u64> {
        self.confirmed.get(sender).copied()
    }

    /// Fails with `ReplayedNonce` when `nonce` is not above the sender's last confirmed nonce.
    pub fn check(&self, sender: &str, nonce: u64) -> Result<(), ChainError> {
        match self.last_confirmed(sender) {
            Some(confirmed) if nonce <= confirmed => Err(ChainError::ReplayedNonce {
                sender: sender.to_string(),
                nonce,
                confirmed,
            }),
            _ => Ok(()),
        }
    }

    pub fn check_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        self.check(&tx.sender_address(), tx.nonce)
    }

    pub fn record(&mut self, sender: &str, nonce: u64) {
        let entry = self.confirmed.entry(sender.to_string()).or_insert(nonce);
        if nonce > *entry {
            *entry = nonce;
        }
    }

    pub fn record_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.record(&tx.sender_address(), tx.nonce);
        }
    }

    pub fn rebuild(blocks: &[Block]) -> Self {
        let mut index = Self::new();
        for block in blocks {
            index.record_block(block);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_nonce_accepted() {
        let index = NonceIndex::new();
        assert!(index.check("alice", 0).is_ok());
        assert_eq!(index.last_confirmed("alice"), None);
    }

    #[test]
    fn test_equal_or_lower_nonce_replayed() {
        let mut index = NonceIndex::new();
        index.record("alice", 5);
        assert_eq!(
            index.check("alice", 5),
            Err(ChainError::ReplayedNonce {
                sender: "alice".to_string(),
                nonce: 5,
                confirmed: 5,
            })
        );
        assert!(index.check("alice", 4).is_err());
        assert!(index.check("alice", 6).is_ok());
        assert!(index.check("bob", 5).is_ok());
    }

    #[test]
    fn test_record_keeps_maximum() {
        let mut index = NonceIndex::new();
        index.record("alice", 9);
        index.record("alice", 3);
        assert_eq!(index.last_confirmed("alice"), Some(9));
    }
}
