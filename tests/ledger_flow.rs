//! Integration tests for submission, mining and appending

use qrledger::blockchain::{Block, GENESIS_TIMESTAMP};
use parking_lot::Mutex;
use qrledger::consensus::{CancelFlag, ConsensusStrategy, Proof, ProofOfWork};
use qrledger::contracts::ContractKind;
use qrledger::crypto::{generate_keypair, KeyPair, Scheme};
use qrledger::transaction::Transaction;
use qrledger::{ChainError, Ledger, MineOutcome};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn keys(scheme: Scheme) -> KeyPair {
    generate_keypair(scheme).expect("key generation")
}

fn transfer(from: &KeyPair, to: &KeyPair, amount: u64, nonce: u64) -> Transaction {
    let mut tx = Transaction::new(from.public.clone(), to.public.clone(), amount, nonce);
    tx.sign(&from.secret).expect("signing");
    tx
}

/// Zero-difficulty work that parks inside the proof search until released.
struct GatedWork {
    inner: ProofOfWork,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl GatedWork {
    /// Returns the strategy, a receiver signalled when a search starts and a
    /// sender that lets the search finish.
    fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = GatedWork {
            inner: ProofOfWork::new(0).expect("difficulty 0"),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        (Arc::new(gate), entered_rx, release_tx)
    }
}

impl ConsensusStrategy for GatedWork {
    fn name(&self) -> &'static str {
        "gated-work"
    }

    fn find_proof(&self, block: &mut Block, cancel: &CancelFlag) -> qrledger::Result<Proof> {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
        self.inner.find_proof(block, cancel)
    }

    fn is_valid(&self, block: &Block, proof: &Proof) -> bool {
        self.inner.is_valid(block, proof)
    }
}

fn cancel_when_searching(ledger: &Ledger) {
    while !ledger.cancel_mining() {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_genesis_reproducible_across_ledgers() -> Result<(), ChainError> {
    let a = Ledger::proof_of_work(1)?;
    let b = Ledger::proof_of_work(3)?;
    assert_eq!(a.len(), 1);
    assert_eq!(a.last_block().hash, b.last_block().hash);
    assert_eq!(a.last_block(), Block::genesis(GENESIS_TIMESTAMP));
    Ok(())
}

#[test]
fn test_submit_and_mine() -> Result<(), ChainError> {
    let ledger = Ledger::proof_of_work(2)?;
    let alice = keys(Scheme::Secp256k1);
    let bob = keys(Scheme::Ed25519);

    ledger.submit_transaction(transfer(&alice, &bob, 10, 1))?;
    ledger.submit_transaction(transfer(&alice, &bob, 20, 2))?;
    ledger.submit_transaction(transfer(&bob, &alice, 5, 1))?;
    assert_eq!(ledger.pending_count(), 3);

    let MineOutcome::Mined { index, hash } = ledger.mine()? else {
        panic!("expected a block");
    };
    assert_eq!(index, 1);
    assert_eq!(ledger.pending_count(), 0);

    let block = ledger.block(1).expect("block 1");
    assert_eq!(block.hash, hash);
    assert!(block.hash_hex().starts_with("00"));
    assert_eq!(block.previous_hash, ledger.block(0).expect("genesis").hash);
    let amounts: Vec<u64> = block.transactions.iter().map(|tx| tx.amount).collect();
    assert_eq!(amounts, vec![10, 20, 5]);

    assert_eq!(ledger.last_confirmed_nonce(&alice.public), Some(2));
    ledger.validate_chain()?;
    Ok(())
}

#[test]
fn test_flipped_signature_rejected_on_submit() -> Result<(), ChainError> {
    let ledger = Ledger::proof_of_work(1)?;
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);

    let mut tx = transfer(&alice, &bob, 10, 1);
    if let Some(sig) = tx.signature.as_mut() {
        let last = sig.len() - 1;
        sig[last] ^= 0xFF;
    }
    assert!(!tx.verify());
    assert_eq!(ledger.submit_transaction(tx), Err(ChainError::InvalidSignature));
    assert_eq!(ledger.pending_count(), 0);
    Ok(())
}

#[test]
fn test_replayed_nonce_after_confirmation() -> Result<(), ChainError> {
    let ledger = Ledger::proof_of_work(1)?;
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);

    ledger.submit_transaction(transfer(&alice, &bob, 1, 5))?;
    ledger.mine()?;

    let err = ledger.submit_transaction(transfer(&alice, &bob, 2, 5)).unwrap_err();
    assert!(matches!(err, ChainError::ReplayedNonce { nonce: 5, confirmed: 5, .. }));
    assert!(matches!(
        ledger.submit_transaction(transfer(&alice, &bob, 2, 4)),
        Err(ChainError::ReplayedNonce { .. })
    ));
    ledger.submit_transaction(transfer(&alice, &bob, 2, 6))?;
    Ok(())
}

#[test]
fn test_append_with_bad_linkage_leaves_chain_unchanged() -> Result<(), ChainError> {
    let pow = Arc::new(ProofOfWork::new(1)?);
    let ledger = Ledger::new(pow.clone());

    let mut orphan = Block::new(1, vec![], [0xAB; 32], None);
    let proof = pow.find_proof(&mut orphan, &CancelFlag::new())?;
    assert!(pow.is_valid(&orphan, &proof));

    assert_eq!(ledger.append_block(orphan, proof), Err(ChainError::InvalidBlockLinkage));
    assert_eq!(ledger.len(), 1);
    Ok(())
}

#[test]
fn test_append_with_foreign_proof_rejected() -> Result<(), ChainError> {
    let pow = Arc::new(ProofOfWork::new(1)?);
    let ledger = Ledger::new(pow.clone());
    let tail = ledger.last_block();

    let mut first = Block::new(1, vec![], tail.hash, Some(tail.timestamp + 1));
    let mut second = Block::new(1, vec![], tail.hash, Some(tail.timestamp + 2));
    pow.find_proof(&mut first, &CancelFlag::new())?;
    let foreign = pow.find_proof(&mut second, &CancelFlag::new())?;

    assert!(matches!(
        ledger.append_block(first.clone(), foreign),
        Err(ChainError::ConsensusRejected(_))
    ));
    assert_eq!(ledger.len(), 1);

    let own = Proof::Work { hash: first.hash };
    ledger.append_block(first, own)?;
    assert_eq!(ledger.len(), 2);
    Ok(())
}

#[test]
fn test_append_externally_sealed_block() -> Result<(), ChainError> {
    let pow = Arc::new(ProofOfWork::new(1)?);
    let ledger = Ledger::new(pow.clone());
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);

    let pending = transfer(&alice, &bob, 3, 1);
    let other = transfer(&bob, &alice, 1, 1);
    ledger.submit_transaction(pending.clone())?;
    ledger.submit_transaction(other.clone())?;

    let tail = ledger.last_block();
    let mut block = Block::new(1, vec![pending], tail.hash, None);
    let proof = pow.find_proof(&mut block, &CancelFlag::new())?;
    ledger.append_block(block, proof)?;

    // Only the included transaction leaves the pool
    assert_eq!(ledger.pending_transactions(), vec![other]);
    Ok(())
}

#[test]
fn test_block_with_tampered_transaction_rejected() -> Result<(), ChainError> {
    let pow = Arc::new(ProofOfWork::new(1)?);
    let ledger = Ledger::new(pow.clone());
    let alice = keys(Scheme::Secp256k1);
    let bob = keys(Scheme::Secp256k1);

    let mut tx = transfer(&alice, &bob, 3, 1);
    tx.amount = 3_000;
    let tail = ledger.last_block();
    let mut block = Block::new(1, vec![tx], tail.hash, None);
    let proof = pow.find_proof(&mut block, &CancelFlag::new())?;

    assert!(matches!(ledger.append_block(block, proof), Err(ChainError::InvalidTransaction(_))));
    assert_eq!(ledger.len(), 1);
    Ok(())
}

#[test]
fn test_cancel_mining_keeps_pool() -> Result<(), ChainError> {
    // Unreachable target: only cancellation ends the search
    let ledger = Arc::new(Ledger::proof_of_work(64)?);
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);
    ledger.submit_transaction(transfer(&alice, &bob, 1, 1))?;

    let miner = {
        let ledger = Arc::clone(&ledger);
        thread::spawn(move || ledger.mine())
    };
    cancel_when_searching(&ledger);

    let result = miner.join().expect("miner thread");
    assert_eq!(result, Err(ChainError::MiningCancelled));
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.pending_count(), 1);

    // Mining can be retried once the difficulty is reachable
    ledger.set_difficulty(1)?;
    assert!(matches!(ledger.mine()?, MineOutcome::Mined { index: 1, .. }));
    Ok(())
}

#[test]
fn test_submissions_during_mining_are_kept() -> Result<(), ChainError> {
    let ledger = Arc::new(Ledger::proof_of_work(64)?);
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);
    ledger.submit_transaction(transfer(&alice, &bob, 1, 1))?;

    let miner = {
        let ledger = Arc::clone(&ledger);
        thread::spawn(move || ledger.mine())
    };
    while !ledger.is_mining() {
        thread::sleep(Duration::from_millis(5));
    }
    let late = transfer(&bob, &alice, 7, 1);
    ledger.submit_transaction(late.clone())?;
    cancel_when_searching(&ledger);
    assert_eq!(miner.join().expect("miner thread"), Err(ChainError::MiningCancelled));
    ledger.set_difficulty(0)?;

    let MineOutcome::Mined { index, .. } = ledger.mine()? else {
        panic!("expected a block");
    };
    let block = ledger.block(index).expect("mined block");
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(block.transactions[1], late);
    assert_eq!(ledger.pending_count(), 0);
    Ok(())
}

#[test]
fn test_cancel_while_idle_has_no_effect() -> Result<(), ChainError> {
    let ledger = Ledger::proof_of_work(0)?;
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);

    assert!(!ledger.cancel_mining());
    ledger.submit_transaction(transfer(&alice, &bob, 1, 1))?;
    assert!(matches!(ledger.mine()?, MineOutcome::Mined { index: 1, .. }));
    assert_eq!(ledger.pending_count(), 0);
    Ok(())
}

#[test]
fn test_submission_during_successful_search_stays_pending() -> Result<(), ChainError> {
    let (gate, entered, release) = GatedWork::new();
    let ledger = Arc::new(Ledger::new(gate));
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);
    let first = transfer(&alice, &bob, 1, 1);
    ledger.submit_transaction(first.clone())?;

    let miner = {
        let ledger = Arc::clone(&ledger);
        thread::spawn(move || ledger.mine())
    };
    entered.recv().expect("search started");
    let late = transfer(&bob, &alice, 7, 1);
    ledger.submit_transaction(late.clone())?;
    release.send(()).expect("release search");

    let MineOutcome::Mined { index, .. } = miner.join().expect("miner thread")? else {
        panic!("expected a block");
    };
    assert_eq!(ledger.block(index).expect("mined block").transactions, vec![first]);
    assert_eq!(ledger.pending_transactions(), vec![late]);
    Ok(())
}

#[test]
fn test_deploy_waits_for_block_in_progress() -> Result<(), ChainError> {
    let (gate, entered, release) = GatedWork::new();
    let ledger = Arc::new(Ledger::new(gate));
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::Ed25519);
    ledger.submit_transaction(transfer(&alice, &bob, 1, 1))?;
    let root_before = ledger.contract_state_root();

    let miner = {
        let ledger = Arc::clone(&ledger);
        thread::spawn(move || ledger.mine())
    };
    entered.recv().expect("search started");
    let deployer = {
        let ledger = Arc::clone(&ledger);
        let owner = alice.public.clone();
        thread::spawn(move || ledger.deploy_contract("kv", owner, ContractKind::KeyValue))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!deployer.is_finished());
    release.send(()).expect("release search");

    let MineOutcome::Mined { index, .. } = miner.join().expect("miner thread")? else {
        panic!("expected a block");
    };
    deployer.join().expect("deployer thread")?;

    assert_eq!(ledger.block(index).expect("mined block").state_root, root_before);
    assert_ne!(ledger.contract_state_root(), root_before);
    ledger.validate_chain()?;
    Ok(())
}

#[test]
fn test_concurrent_submitters() -> Result<(), ChainError> {
    let ledger = Arc::new(Ledger::proof_of_work(1)?);
    let recipient = keys(Scheme::Ed25519);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            let to = recipient.clone();
            thread::spawn(move || -> Result<(), ChainError> {
                let from = keys(Scheme::Ed25519);
                for nonce in 1..=5 {
                    ledger.submit_transaction(transfer(&from, &to, 1, nonce))?;
                }
                Ok(())
            })
        })
        .collect();

    let mut mined = 0;
    for handle in handles {
        handle.join().expect("submitter thread")?;
        if let MineOutcome::Mined { index, .. } = ledger.mine()? {
            mined += ledger.block(index).expect("block").transactions.len();
        }
    }
    while let MineOutcome::Mined { index, .. } = ledger.mine()? {
        mined += ledger.block(index).expect("block").transactions.len();
    }

    assert_eq!(mined, 20);
    assert_eq!(ledger.pending_count(), 0);
    ledger.validate_chain()?;
    Ok(())
}

#[test]
fn test_oversized_transaction_rejected() -> Result<(), ChainError> {
    let ledger = Ledger::proof_of_work(1)?;
    let alice = keys(Scheme::Ed25519);
    let bob = keys(Scheme::X25519);

    let mut tx = Transaction::new(alice.public.clone(), bob.public.clone(), 1, 1)
        .with_sealed_memo(&bob.public, &vec![0u8; 200_000])?;
    tx.sign(&alice.secret)?;
    assert!(matches!(
        ledger.submit_transaction(tx),
        Err(ChainError::InvalidTransaction(msg)) if msg.contains("too large")
    ));
    Ok(())
}
