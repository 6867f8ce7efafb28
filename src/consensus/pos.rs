use super::{CancelFlag, ConsensusStrategy, Proof};
use crate::blockchain::{Block, Sha256Hash};
use crate::error::{ChainError, Result};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

const SEED_DOMAIN: &[u8] = b"QRL-POS";

/// Stakeholder address to staked amount. Iteration is in ascending address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StakeTable {
    stakes: BTreeMap<String, u64>,
}

impl StakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stake(&mut self, address: &str, amount: u64) -> Result<u64> {
        let entry = self.stakes.entry(address.to_string()).or_insert(0);
        *entry = entry.checked_add(amount).ok_or_else(|| {
            ChainError::InvalidTransaction(format!("stake overflow for {}", address))
        })?;
        Ok(*entry)
    }

    /// Lowers a stake; entries that reach zero are dropped from the table.
    pub fn remove_stake(&mut self, address: &str, amount: u64) -> Result<u64> {
        let available = self.stake_of(address);
        if amount > available {
            return Err(ChainError::InsufficientStake {
                address: address.to_string(),
                available,
                requested: amount,
            });
        }

        let remaining = available - amount;
        if remaining == 0 {
            self.stakes.remove(address);
        } else {
            self.stakes.insert(address.to_string(), remaining);
        }
        Ok(remaining)
    }

    pub fn stake_of(&self, address: &str) -> u64 {
        self.stakes.get(address).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u128 {
        self.stakes.values().map(|s| *s as u128).sum()
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    /// Cumulative-sum walk: the first stakeholder whose running total reaches
    /// `threshold` is selected. `threshold` is in `1..=total`.
    pub fn forger_for_threshold(&self, threshold: u128) -> Option<String> {
        let mut cumulative: u128 = 0;
        for (address, stake) in &self.stakes {
            cumulative += *stake as u128;
            if cumulative >= threshold {
                return Some(address.clone());
            }
        }
        None
    }
}

/// Deterministic threshold in `1..=total` bound to `seed`; `None` for a
/// zero total.
pub fn draw_threshold(seed: &Sha256Hash, total: u128) -> Option<u128> {
    if total == 0 {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(SEED_DOMAIN);
    hasher.update(seed);
    let digest: [u8; 32] = hasher.finalize().into();

    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    Some(1 + u128::from_be_bytes(head) % total)
}

/// Stake-weighted forger selection seeded by the previous block hash.
#[derive(Debug, Default)]
pub struct ProofOfStake {
    table: RwLock<StakeTable>,
    forger_reward: u64,
}

impl ProofOfStake {
    pub fn new(forger_reward: u64) -> Self {
        ProofOfStake {
            table: RwLock::new(StakeTable::new()),
            forger_reward,
        }
    }

    pub fn with_stakes<I, S>(forger_reward: u64, stakes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let pos = Self::new(forger_reward);
        for (address, amount) in stakes {
            pos.add_stake(address.as_ref(), amount)?;
        }
        Ok(pos)
    }

    pub fn add_stake(&self, address: &str, amount: u64) -> Result<u64> {
        self.table.write().add_stake(address, amount)
    }

    pub fn remove_stake(&self, address: &str, amount: u64) -> Result<u64> {
        self.table.write().remove_stake(address, amount)
    }

    pub fn stake_of(&self, address: &str) -> u64 {
        self.table.read().stake_of(address)
    }

    pub fn total_stake(&self) -> u128 {
        self.table.read().total()
    }

    pub fn stake_table(&self) -> StakeTable {
        self.table.read().clone()
    }

    pub fn forger_reward(&self) -> u64 {
        self.forger_reward
    }

    /// `None` when no stake is held.
    pub fn select_forger(&self, seed: &Sha256Hash) -> Option<String> {
        let table = self.table.read();
        draw_threshold(seed, table.total()).and_then(|threshold| table.forger_for_threshold(threshold))
    }
}

impl ConsensusStrategy for ProofOfStake {
    fn name(&self) -> &'static str {
        "proof-of-stake"
    }

    fn find_proof(&self, block: &mut Block, cancel: &CancelFlag) -> Result<Proof> {
        if cancel.is_cancelled() {
            return Err(ChainError::MiningCancelled);
        }
        let forger = self.select_forger(&block.previous_hash).ok_or(ChainError::NoForger)?;
        block.nonce = 0;
        block.refresh_hash();
        debug!("Selected forger {} for block {}", forger, block.index);
        Ok(Proof::Stake { forger })
    }

    fn is_valid(&self, block: &Block, proof: &Proof) -> bool {
        match proof {
            Proof::Stake { forger } => {
                block.hash == block.recompute_hash()
                    && self.select_forger(&block.previous_hash).as_ref() == Some(forger)
            }
            Proof::Work { .. } => false,
        }
    }

    fn on_block_appended(&self, block: &Block) -> Result<()> {
        let Some(forger) = &block.forger else {
            return Ok(());
        };
        if self.forger_reward == 0 {
            return Ok(());
        }
        let stake = self.add_stake(forger, self.forger_reward)?;
        debug!("Credited {} stake to forger {} (now {})", self.forger_reward, forger, stake);
        Ok(())
    }

    fn as_proof_of_stake(&self) -> Option<&ProofOfStake> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, u64)]) -> StakeTable {
        let mut table = StakeTable::new();
        for (address, amount) in entries {
            table.add_stake(address, *amount).unwrap();
        }
        table
    }

    #[test]
    fn test_threshold_walk_70_30() {
        let table = table(&[("A", 70), ("B", 30)]);
        assert_eq!(table.total(), 100);
        // Half of total stake lands inside A's range.
        assert_eq!(table.forger_for_threshold(50).as_deref(), Some("A"));
        assert_eq!(table.forger_for_threshold(70).as_deref(), Some("A"));
        assert_eq!(table.forger_for_threshold(71).as_deref(), Some("B"));
        assert_eq!(table.forger_for_threshold(100).as_deref(), Some("B"));
    }

    #[test]
    fn test_empty_table_has_no_forger() {
        let pos = ProofOfStake::new(1);
        assert_eq!(pos.select_forger(&[0u8; 32]), None);

        let mut block = Block::new(1, vec![], [0u8; 32], Some(1));
        assert_eq!(
            pos.find_proof(&mut block, &CancelFlag::new()),
            Err(ChainError::NoForger)
        );
    }

    #[test]
    fn test_remove_stake_never_negative() {
        let mut table = table(&[("A", 10)]);
        assert_eq!(
            table.remove_stake("A", 11),
            Err(ChainError::InsufficientStake {
                address: "A".to_string(),
                available: 10,
                requested: 11,
            })
        );
        assert_eq!(table.remove_stake("A", 4).unwrap(), 6);
        assert_eq!(table.remove_stake("A", 6).unwrap(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_threshold_in_range_and_deterministic() {
        for i in 0..50u8 {
            let seed = [i; 32];
            let t = draw_threshold(&seed, 100).unwrap();
            assert!((1..=100).contains(&t));
            assert_eq!(Some(t), draw_threshold(&seed, 100));
        }
        assert_eq!(draw_threshold(&[1u8; 32], 1), Some(1));
    }

    #[test]
    fn test_threshold_without_stake() {
        assert_eq!(draw_threshold(&[0u8; 32], 0), None);
        assert_eq!(ProofOfStake::new(3).select_forger(&[0u8; 32]), None);
    }

    #[test]
    fn test_selection_is_reproducible() {
        let pos = ProofOfStake::with_stakes(0, [("A", 70), ("B", 30)]).unwrap();
        let seed = [7u8; 32];
        let first = pos.select_forger(&seed);
        assert!(first.is_some());
        assert_eq!(first, pos.select_forger(&seed));
    }

    #[test]
    fn test_proof_validation() {
        let pos = ProofOfStake::with_stakes(0, [("A", 70), ("B", 30)]).unwrap();
        let mut block = Block::new(1, vec![], [3u8; 32], Some(10));
        let proof = pos.find_proof(&mut block, &CancelFlag::new()).unwrap();
        assert!(pos.is_valid(&block, &proof));

        let Proof::Stake { forger } = &proof else {
            panic!("expected stake proof");
        };
        let other = if forger == "A" { "B" } else { "A" };
        assert!(!pos.is_valid(&block, &Proof::Stake { forger: other.to_string() }));
        assert!(!pos.is_valid(&block, &Proof::Work { hash: block.hash }));
    }

    #[test]
    fn test_forger_reward_settlement() {
        let pos = ProofOfStake::with_stakes(5, [("A", 10)]).unwrap();
        let mut block = Block::new(1, vec![], [1u8; 32], Some(10));
        let proof = pos.find_proof(&mut block, &CancelFlag::new()).unwrap();
        proof.apply_to(&mut block);
        pos.on_block_appended(&block).unwrap();
        assert_eq!(pos.stake_of("A"), 15);
    }
}
