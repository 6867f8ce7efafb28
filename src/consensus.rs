//! Block sealing strategies
//!
//! A ledger holds exactly one [`ConsensusStrategy`], chosen at construction.
//! Proof-of-work searches a nonce until the block hash has enough leading zero
//! hex digits; proof-of-stake picks a forger from the stake table using a seed
//! derived from the previous block hash.

pub mod pos;
pub mod pow;

pub use pos::{ProofOfStake, StakeTable};
pub use pow::ProofOfWork;

use crate::blockchain::{Block, Sha256Hash};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Evidence that a block may be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proof {
    /// The block hash that satisfies the difficulty target.
    Work { hash: Sha256Hash },
    /// The stakeholder selected to forge this block.
    Stake { forger: String },
}

impl Proof {
    /// Records an accepted proof on the block.
    pub fn apply_to(&self, block: &mut Block) {
        match self {
            Proof::Work { hash } => block.hash = *hash,
            Proof::Stake { forger } => block.forger = Some(forger.clone()),
        }
    }
}

/// Shared cancellation signal for an in-progress proof search.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub trait ConsensusStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produces a proof for `block`, perturbing only the fields the strategy owns.
    fn find_proof(&self, block: &mut Block, cancel: &CancelFlag) -> Result<Proof>;

    /// Checks `proof` against the block's current contents.
    fn is_valid(&self, block: &Block, proof: &Proof) -> bool;

    /// Called after a block has been appended.
    fn on_block_appended(&self, _block: &Block) -> Result<()> {
        Ok(())
    }

    fn as_proof_of_stake(&self) -> Option<&ProofOfStake> {
        None
    }

    fn as_proof_of_work(&self) -> Option<&ProofOfWork> {
        None
    }
}
