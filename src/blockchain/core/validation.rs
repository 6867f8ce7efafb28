use crate::error::ChainError;
use rayon::prelude::*;
use std::collections::HashMap;

use super::chain::Block;
use super::state::NonceIndex;

/// Verifies every transaction signature in the block, in parallel.
pub fn validate_signatures(block: &Block) -> Result<(), ChainError> {
    let bad = block
        .transactions
        .par_iter()
        .position_first(|tx| !tx.verify());

    match bad {
        Some(position) => Err(ChainError::InvalidTransaction(format!(
            "Transaction {} in block {} has an invalid signature",
            position, block.index
        ))),
        None => Ok(()),
    }
}

/// Nonces must exceed the sender's confirmed nonce and strictly increase
/// within the block.
pub fn validate_block_nonces(block: &Block, confirmed: &NonceIndex) -> Result<(), ChainError> {
    let mut in_block: HashMap<String, u64> = HashMap::new();
    for tx in &block.transactions {
        let sender = tx.sender_address();
        confirmed.check(&sender, tx.nonce)?;

        if let Some(previous) = in_block.get(&sender) {
            if tx.nonce <= *previous {
                return Err(ChainError::ReplayedNonce {
                    sender,
                    nonce: tx.nonce,
                    confirmed: *previous,
                });
            }
        }
        in_block.insert(sender, tx.nonce);
    }
    Ok(())
}

/// Checks that `block` extends `parent`: linkage first, then index continuity.
pub fn validate_linkage(parent: &Block, block: &Block) -> Result<(), ChainError> {
    if block.previous_hash != parent.hash {
        return Err(ChainError::InvalidBlockLinkage);
    }
    if block.index != parent.index + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            parent.index + 1,
            block.index
        )));
    }
    Ok(())
}

pub fn validate_block_hash(block: &Block) -> Result<(), ChainError> {
    let expected = block.recompute_hash();
    if expected != block.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Hash mismatch at block {}. Expected {}, but got {}.",
            block.index,
            hex::encode(expected),
            hex::encode(block.hash)
        )));
    }
    Ok(())
}

/// Full structural check of a chain, genesis first. Returns the failure
/// description as `ChainCorrupted`.
pub fn validate_chain(blocks: &[Block]) -> Result<(), ChainError> {
    let genesis = blocks
        .first()
        .ok_or_else(|| ChainError::ChainCorrupted("chain is empty".to_string()))?;
    if genesis.index != 0 || !genesis.transactions.is_empty() {
        return Err(ChainError::ChainCorrupted("malformed genesis block".to_string()));
    }
    validate_block_hash(genesis).map_err(|e| ChainError::ChainCorrupted(e.to_string()))?;

    let mut nonces = NonceIndex::new();
    for pair in blocks.windows(2) {
        let (parent, block) = (&pair[0], &pair[1]);
        validate_linkage(parent, block)
            .and_then(|_| validate_block_hash(block))
            .and_then(|_| validate_signatures(block))
            .and_then(|_| validate_block_nonces(block, &nonces))
            .map_err(|e| ChainError::ChainCorrupted(format!("block {}: {}", block.index, e)))?;
        nonces.record_block(block);
    }
    Ok(())
}
