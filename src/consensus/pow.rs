use super::{CancelFlag, ConsensusStrategy, Proof};
use crate::blockchain::{Block, Sha256Hash};
use crate::error::{ChainError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// 64 hex digits in a SHA-256 hash.
pub const MAX_DIFFICULTY: u32 = 64;

/// Counts leading zero hex digits of `hash`.
pub fn leading_zero_nibbles(hash: &Sha256Hash) -> u32 {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

pub fn meets_difficulty(hash: &Sha256Hash, difficulty: u32) -> bool {
    leading_zero_nibbles(hash) >= difficulty
}

/// Nonce search against a leading-zero-hex-digit target.
#[derive(Debug)]
pub struct ProofOfWork {
    difficulty: AtomicU32,
}

impl ProofOfWork {
    pub fn new(difficulty: u32) -> Result<Self> {
        Self::check_difficulty(difficulty)?;
        Ok(ProofOfWork {
            difficulty: AtomicU32::new(difficulty),
        })
    }

    fn check_difficulty(difficulty: u32) -> Result<()> {
        if difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "difficulty {} exceeds maximum {}",
                difficulty, MAX_DIFFICULTY
            )));
        }
        Ok(())
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty.load(Ordering::SeqCst)
    }

    /// External difficulty adjustment; there is no automatic retargeting.
    pub fn set_difficulty(&self, difficulty: u32) -> Result<()> {
        Self::check_difficulty(difficulty)?;
        self.difficulty.store(difficulty, Ordering::SeqCst);
        Ok(())
    }
}

impl ConsensusStrategy for ProofOfWork {
    fn name(&self) -> &'static str {
        "proof-of-work"
    }

    fn find_proof(&self, block: &mut Block, cancel: &CancelFlag) -> Result<Proof> {
        let difficulty = self.difficulty();
        block.nonce = 0;
        loop {
            if cancel.is_cancelled() {
                debug!("Proof search for block {} cancelled at nonce {}", block.index, block.nonce);
                return Err(ChainError::MiningCancelled);
            }

            let hash = block.recompute_hash();
            if meets_difficulty(&hash, difficulty) {
                block.hash = hash;
                debug!("Found proof for block {} at nonce {}", block.index, block.nonce);
                return Ok(Proof::Work { hash });
            }

            block.nonce = block.nonce.checked_add(1).ok_or_else(|| {
                ChainError::ConsensusRejected("nonce space exhausted".to_string())
            })?;
        }
    }

    fn is_valid(&self, block: &Block, proof: &Proof) -> bool {
        match proof {
            Proof::Work { hash } => {
                *hash == block.recompute_hash() && meets_difficulty(hash, self.difficulty())
            }
            Proof::Stake { .. } => false,
        }
    }

    fn as_proof_of_work(&self) -> Option<&ProofOfWork> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(index: u64) -> Block {
        Block::new(index, vec![], [index as u8; 32], Some(1_700_000_000_000 + index))
    }

    #[test]
    fn test_leading_zero_nibbles() {
        let mut hash = [0xFFu8; 32];
        assert_eq!(leading_zero_nibbles(&hash), 0);
        hash[0] = 0x0F;
        assert_eq!(leading_zero_nibbles(&hash), 1);
        hash[0] = 0x00;
        hash[1] = 0x1F;
        assert_eq!(leading_zero_nibbles(&hash), 2);
        hash[1] = 0x01;
        assert_eq!(leading_zero_nibbles(&hash), 3);
        assert_eq!(leading_zero_nibbles(&[0u8; 32]), 64);
    }

    #[test]
    fn test_find_proof_meets_difficulty() {
        let pow = ProofOfWork::new(2).unwrap();
        let mut block = candidate(1);
        let proof = pow.find_proof(&mut block, &CancelFlag::new()).unwrap();

        let Proof::Work { hash } = &proof else {
            panic!("expected work proof");
        };
        assert!(hex::encode(hash).starts_with("00"));
        assert_eq!(*hash, block.recompute_hash());
        assert!(pow.is_valid(&block, &proof));
    }

    #[test]
    fn test_proof_from_other_block_rejected() {
        let pow = ProofOfWork::new(1).unwrap();
        let mut a = candidate(1);
        let mut b = candidate(2);
        let proof_a = pow.find_proof(&mut a, &CancelFlag::new()).unwrap();
        let proof_b = pow.find_proof(&mut b, &CancelFlag::new()).unwrap();

        assert!(pow.is_valid(&a, &proof_a));
        assert!(!pow.is_valid(&a, &proof_b));
        assert!(!pow.is_valid(&b, &proof_a));
    }

    #[test]
    fn test_forged_proof_string_rejected() {
        let pow = ProofOfWork::new(1).unwrap();
        let block = candidate(3);
        // Satisfies the prefix but does not correspond to the block
        let forged = Proof::Work { hash: [0u8; 32] };
        assert!(!pow.is_valid(&block, &forged));
        assert!(!pow.is_valid(&block, &Proof::Stake { forger: "x".to_string() }));
    }

    #[test]
    fn test_cancelled_search_returns_error() {
        let pow = ProofOfWork::new(MAX_DIFFICULTY).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut block = candidate(1);
        assert_eq!(
            pow.find_proof(&mut block, &cancel),
            Err(ChainError::MiningCancelled)
        );
    }

    #[test]
    fn test_difficulty_adjustment() {
        let pow = ProofOfWork::new(1).unwrap();
        pow.set_difficulty(3).unwrap();
        assert_eq!(pow.difficulty(), 3);
        assert!(pow.set_difficulty(65).is_err());
        assert!(ProofOfWork::new(100).is_err());
        assert_eq!(pow.difficulty(), 3);
    }

    #[test]
    fn test_instances_do_not_share_difficulty() {
        let easy = ProofOfWork::new(0).unwrap();
        let hard = ProofOfWork::new(4).unwrap();
        easy.set_difficulty(1).unwrap();
        assert_eq!(hard.difficulty(), 4);
    }
}
