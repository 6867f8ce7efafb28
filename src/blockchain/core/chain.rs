use crate::config::{Config, ConsensusKind, LedgerConfig, StorageBackend};
use crate::consensus::{CancelFlag, ConsensusStrategy, Proof, ProofOfStake, ProofOfWork};
use crate::contracts::{
    ContentAddressed, ContractEngine, ContractEvent, ContractKind, ContractState, StagedCalls,
    StatePersistence,
};
use crate::crypto::PublicKey;
use crate::error::ChainError;
use crate::mempool::{Mempool, TxHash};
use crate::persistence::{Database, InMemoryStateStore, StateStore};
use crate::transaction::{Params, Transaction};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::state::NonceIndex;
use super::validation;

pub type Sha256Hash = [u8; 32];

/// Previous-hash sentinel carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: Sha256Hash = [0u8; 32];
/// 2023-01-01T00:00:00Z in milliseconds.
pub const GENESIS_TIMESTAMP: u64 = 1672531200000;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub index: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: Sha256Hash,
    /// Contract state digest after this block's calls ran.
    pub state_root: Sha256Hash,
    pub nonce: u64,
    pub hash: Sha256Hash,
    /// Stakeholder that forged the block under proof-of-stake.
    #[serde(default)]
    pub forger: Option<String>,
}

impl Block {
    /// Builds a block and computes its hash. `timestamp` defaults to now.
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: Sha256Hash,
        timestamp: Option<u64>,
    ) -> Self {
        let timestamp = timestamp.unwrap_or_else(now_millis);
        let mut block = Block {
            index,
            timestamp,
            transactions,
            previous_hash,
            state_root: [0u8; 32],
            nonce: 0,
            hash: [0u8; 32],
            forger: None,
        };
        block.refresh_hash();
        block
    }

    pub fn genesis(timestamp: u64) -> Self {
        Block::new(0, Vec::new(), GENESIS_PREVIOUS_HASH, Some(timestamp))
    }

    pub fn with_state_root(mut self, state_root: Sha256Hash) -> Self {
        self.state_root = state_root;
        self.refresh_hash();
        self
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    pub fn transactions_digest(transactions: &[Transaction]) -> Sha256Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.hash());
        }
        hasher.finalize().into()
    }

    /// Hash of the current field values. Reads only; never touches `self.hash`.
    pub fn recompute_hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(Block::transactions_digest(&self.transactions));
        hasher.update(self.previous_hash);
        hasher.update(self.state_root);
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn refresh_hash(&mut self) {
        self.hash = self.recompute_hash();
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MineOutcome {
    /// The pending pool held nothing that could go into a block.
    NothingToMine,
    Mined { index: u64, hash: Sha256Hash },
}

/// Runs every contract call in `transactions` against `engine`. Failed calls
/// are logged as rejections and the rest of the block proceeds.
fn apply_contract_calls(staged: &mut StagedCalls<'_>, transactions: &[Transaction], block_number: u64) {
    for tx in transactions {
        let Some(call) = &tx.contract_call else {
            continue;
        };
        if let Err(e) = staged.execute_call(call, &tx.sender, block_number) {
            staged.record_rejection(call, block_number, &e);
        }
    }
}

/// A single-writer ledger: the chain, the pending pool and the contract
/// engine, sealed by one consensus strategy.
pub struct Ledger {
    chain: RwLock<Vec<Block>>,
    mempool: Mutex<Mempool>,
    nonces: RwLock<NonceIndex>,
    consensus: Arc<dyn ConsensusStrategy>,
    contracts: Mutex<ContractEngine>,
    store: Arc<dyn StateStore>,
    /// Held for the whole of `mine` and `append_block`, and by anything
    /// that changes contract state.
    mining: Mutex<()>,
    /// Cancellation handle of the proof search in progress.
    active_search: Mutex<Option<CancelFlag>>,
    halted: RwLock<Option<String>>,
    max_transaction_size: usize,
}

impl Ledger {
    /// Ledger with an in-memory state store and default limits.
    pub fn new(consensus: Arc<dyn ConsensusStrategy>) -> Self {
        Self::with_options(consensus, Arc::new(InMemoryStateStore::new()), &LedgerConfig::default())
    }

    pub fn with_options(
        consensus: Arc<dyn ConsensusStrategy>,
        store: Arc<dyn StateStore>,
        options: &LedgerConfig,
    ) -> Self {
        let genesis = Block::genesis(options.genesis_timestamp);
        debug!("Created genesis block {}", genesis.hash_hex());

        Ledger {
            chain: RwLock::new(vec![genesis]),
            mempool: Mutex::new(Mempool::with_capacity(options.max_pending)),
            nonces: RwLock::new(NonceIndex::new()),
            consensus,
            contracts: Mutex::new(ContractEngine::new()),
            store,
            mining: Mutex::new(()),
            active_search: Mutex::new(None),
            halted: RwLock::new(None),
            max_transaction_size: options.max_transaction_size,
        }
    }

    /// Proof-of-work ledger with an in-memory store.
    pub fn proof_of_work(difficulty: u32) -> Result<Self, ChainError> {
        Ok(Self::new(Arc::new(ProofOfWork::new(difficulty)?)))
    }

    pub fn from_config(config: &Config) -> Result<Self, ChainError> {
        config.validate()?;

        let consensus: Arc<dyn ConsensusStrategy> = match config.consensus.kind {
            ConsensusKind::Pow => Arc::new(ProofOfWork::new(config.consensus.difficulty)?),
            ConsensusKind::Pos => Arc::new(ProofOfStake::with_stakes(
                config.consensus.forger_reward,
                config.consensus.stakes.iter().map(|s| (s.address.as_str(), s.amount)),
            )?),
        };

        let store: Arc<dyn StateStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryStateStore::new()),
            StorageBackend::Sqlite => {
                if let Some(parent) = Path::new(&config.storage.path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Arc::new(Database::open(&config.storage.path)?)
            }
        };

        info!(
            "Ledger configured with {} and {:?} storage",
            consensus.name(),
            config.storage.backend
        );
        Ok(Self::with_options(consensus, store, &config.ledger))
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Admits a signed transaction to the pending pool.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<TxHash, ChainError> {
        if let Err(e) = tx.validate(self.max_transaction_size) {
            warn!("Rejected transaction {}: {}", tx.hash_str(), e);
            return Err(e);
        }
        if let Err(e) = self.nonces.read().check_transaction(&tx) {
            warn!("Rejected transaction {}: {}", tx.hash_str(), e);
            return Err(e);
        }

        let hash = self.mempool.lock().add_transaction(tx)?;
        debug!("Admitted transaction {}", hex::encode(hash));
        Ok(hash)
    }

    // ------------------------------------------------------------------
    // Mining
    // ------------------------------------------------------------------

    /// Assembles the pending pool into a block, seals it and appends it.
    ///
    /// On any failure the pool is left as it was, apart from transactions
    /// whose nonces were already confirmed.
    pub fn mine(&self) -> Result<MineOutcome, ChainError> {
        let _mining = self.mining.lock();
        self.ensure_not_halted()?;

        let snapshot = self.mempool.lock().snapshot();
        if snapshot.is_empty() {
            return Ok(MineOutcome::NothingToMine);
        }

        let (transactions, stale) = self.select_transactions(snapshot);
        if !stale.is_empty() {
            let dropped = self.mempool.lock().remove_transactions(&stale);
            warn!("Dropped {} pending transactions with confirmed nonces", dropped);
        }
        if transactions.is_empty() {
            return Ok(MineOutcome::NothingToMine);
        }

        let parent = self.last_block();
        let index = parent.index + 1;
        let timestamp = now_millis().max(parent.timestamp + 1);
        let mut block = Block::new(index, transactions, parent.hash, Some(timestamp));

        block.state_root = {
            let contracts = self.contracts.lock();
            let mut staged = contracts.stage();
            apply_contract_calls(&mut staged, &block.transactions, index);
            staged.state_root()
        };
        block.refresh_hash();

        debug!(
            "Searching {} proof for block {} ({} transactions)",
            self.consensus.name(),
            index,
            block.transactions.len()
        );
        let cancel = CancelFlag::new();
        *self.active_search.lock() = Some(cancel.clone());
        let proof = self.consensus.find_proof(&mut block, &cancel);
        *self.active_search.lock() = None;
        let proof = proof?;

        let tx_count = block.transactions.len();
        let hash = self.append_locked(block, proof)?;
        info!("Mined block {} with {} transactions ({})", index, tx_count, hex::encode(hash));
        Ok(MineOutcome::Mined { index, hash })
    }

    /// Picks pool entries in insertion order. Returns the block candidates
    /// and the hashes of entries whose nonce is already confirmed.
    fn select_transactions(&self, snapshot: Vec<Transaction>) -> (Vec<Transaction>, HashSet<TxHash>) {
        let nonces = self.nonces.read();
        let mut in_block: HashMap<String, u64> = HashMap::new();
        let mut selected = Vec::with_capacity(snapshot.len());
        let mut stale = HashSet::new();

        for tx in snapshot {
            let sender = tx.sender_address();
            if nonces.check(&sender, tx.nonce).is_err() {
                stale.insert(tx.hash());
                continue;
            }
            if let Some(previous) = in_block.get(&sender) {
                if tx.nonce <= *previous {
                    debug!("Deferring transaction {} (nonce {} after {})", tx.hash_str(), tx.nonce, previous);
                    continue;
                }
            }
            in_block.insert(sender, tx.nonce);
            selected.push(tx);
        }
        (selected, stale)
    }

    /// Stops the proof search in progress. Returns false, and affects
    /// nothing, when no search is running.
    pub fn cancel_mining(&self) -> bool {
        match &*self.active_search.lock() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_mining(&self) -> bool {
        self.active_search.lock().is_some()
    }

    // ------------------------------------------------------------------
    // Appending
    // ------------------------------------------------------------------

    /// Appends a sealed block.
    ///
    /// Fails with `InvalidBlockLinkage` when `previous_hash` is not the tail
    /// hash and `ConsensusRejected` when the strategy rejects `proof`. The chain
    /// is unchanged on any error.
    pub fn append_block(&self, block: Block, proof: Proof) -> Result<(), ChainError> {
        let _mining = self.mining.lock();
        self.append_locked(block, proof).map(|_| ())
    }

    fn append_locked(&self, mut block: Block, proof: Proof) -> Result<Sha256Hash, ChainError> {
        self.ensure_not_halted()?;

        let parent = self.last_block();
        validation::validate_linkage(&parent, &block)?;

        if !self.consensus.is_valid(&block, &proof) {
            return Err(ChainError::ConsensusRejected(format!(
                "{} proof does not hold for block {}",
                self.consensus.name(),
                block.index
            )));
        }

        validation::validate_signatures(&block)?;
        validation::validate_block_nonces(&block, &self.nonces.read())?;

        let mut contracts = self.contracts.lock();
        let changes = {
            let mut staged = contracts.stage();
            apply_contract_calls(&mut staged, &block.transactions, block.index);
            let root = staged.state_root();
            if root != block.state_root {
                return Err(ChainError::InvalidBlock(format!(
                    "State root mismatch at block {}. Expected {}, but got {}.",
                    block.index,
                    hex::encode(root),
                    hex::encode(block.state_root)
                )));
            }
            staged.finish()
        };

        proof.apply_to(&mut block);
        self.chain.write().push(block.clone());
        self.nonces.write().record_block(&block);
        contracts.commit(changes);
        drop(contracts);

        let included: HashSet<TxHash> = block.transactions.iter().map(|tx| tx.hash()).collect();
        let removed = self.mempool.lock().remove_transactions(&included);
        debug!("Cleared {} transactions from the pending pool", removed);

        if let Err(e) = self.consensus.on_block_appended(&block) {
            warn!("Post-append settlement for block {} failed: {}", block.index, e);
        }

        self.check_tail_integrity()?;
        Ok(block.hash)
    }

    fn check_tail_integrity(&self) -> Result<(), ChainError> {
        let failure = {
            let chain = self.chain.read();
            match chain.as_slice() {
                [.., parent, tail] => validation::validate_linkage(parent, tail)
                    .and_then(|_| validation::validate_block_hash(tail))
                    .err(),
                _ => None,
            }
        };

        match failure {
            Some(e) => {
                let reason = e.to_string();
                self.halt(&reason);
                Err(ChainError::ChainCorrupted(reason))
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Re-checks every block. A failure halts further appends.
    pub fn validate_chain(&self) -> Result<(), ChainError> {
        let result = validation::validate_chain(&self.chain.read());
        if let Err(ChainError::ChainCorrupted(reason)) = &result {
            self.halt(reason);
        }
        result
    }

    fn halt(&self, reason: &str) {
        error!("Chain integrity violated, halting appends: {}", reason);
        *self.halted.write() = Some(reason.to_string());
    }

    fn ensure_not_halted(&self) -> Result<(), ChainError> {
        match &*self.halted.read() {
            Some(reason) => Err(ChainError::ChainCorrupted(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    // ------------------------------------------------------------------
    // Stake and difficulty
    // ------------------------------------------------------------------

    fn proof_of_stake(&self) -> Result<&ProofOfStake, ChainError> {
        self.consensus
            .as_proof_of_stake()
            .ok_or_else(|| ChainError::ConfigError(format!("ledger uses {}, not proof-of-stake", self.consensus.name())))
    }

    pub fn add_stake(&self, address: &str, amount: u64) -> Result<u64, ChainError> {
        let stake = self.proof_of_stake()?.add_stake(address, amount)?;
        debug!("Stake for {} raised to {}", address, stake);
        Ok(stake)
    }

    pub fn remove_stake(&self, address: &str, amount: u64) -> Result<u64, ChainError> {
        let stake = self.proof_of_stake()?.remove_stake(address, amount)?;
        debug!("Stake for {} lowered to {}", address, stake);
        Ok(stake)
    }

    pub fn stake_of(&self, address: &str) -> Result<u64, ChainError> {
        Ok(self.proof_of_stake()?.stake_of(address))
    }

    pub fn set_difficulty(&self, difficulty: u32) -> Result<(), ChainError> {
        self.consensus
            .as_proof_of_work()
            .ok_or_else(|| ChainError::ConfigError(format!("ledger uses {}, not proof-of-work", self.consensus.name())))?
            .set_difficulty(difficulty)
    }

    // ------------------------------------------------------------------
    // Contracts
    // ------------------------------------------------------------------

    /// Deploys a contract whose states go to the ledger's state store.
    /// Waits for a block being mined or appended.
    pub fn deploy_contract(&self, address: &str, owner: PublicKey, kind: ContractKind) -> Result<Sha256Hash, ChainError> {
        let persistence = Arc::new(ContentAddressed::new(self.store.clone()));
        self.deploy_contract_with(address, owner, kind, persistence)
    }

    pub fn deploy_contract_with(
        &self,
        address: &str,
        owner: PublicKey,
        kind: ContractKind,
        persistence: Arc<dyn StatePersistence>,
    ) -> Result<Sha256Hash, ChainError> {
        let _mining = self.mining.lock();
        let hash = self.contracts.lock().deploy(address, owner, kind, persistence)?;
        info!("Deployed {} contract at {}", kind, address);
        Ok(hash)
    }

    /// Direct call outside block assembly, stamped with the current block
    /// number. Waits for a block being mined or appended.
    pub fn execute_contract(
        &self,
        address: &str,
        action: &str,
        params: &Params,
        caller: &PublicKey,
        signature: &[u8],
    ) -> Result<Sha256Hash, ChainError> {
        let _mining = self.mining.lock();
        let block_number = self.current_block_number();
        self.contracts
            .lock()
            .execute(address, action, params, caller, signature, block_number)
    }

    pub fn contract_state(&self, address: &str) -> Option<ContractState> {
        self.contracts.lock().state_of(address).cloned()
    }

    pub fn contract_state_at(&self, address: &str, hash: &Sha256Hash) -> Result<Option<ContractState>, ChainError> {
        self.contracts.lock().state_at(address, hash)
    }

    pub fn contract_events(&self) -> Vec<ContractEvent> {
        self.contracts.lock().events().to_vec()
    }

    pub fn contract_state_root(&self) -> Sha256Hash {
        self.contracts.lock().state_root()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.chain.read().len()
    }

    /// Always false; a ledger holds at least its genesis block.
    pub fn is_empty(&self) -> bool {
        self.chain.read().is_empty()
    }

    /// Index of the chain tail.
    pub fn current_block_number(&self) -> u64 {
        self.chain.read().last().map_or(0, |b| b.index)
    }

    pub fn last_block(&self) -> Block {
        let chain = self.chain.read();
        match chain.last() {
            Some(block) => block.clone(),
            None => Block::genesis(GENESIS_TIMESTAMP),
        }
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        self.chain.read().get(index as usize).cloned()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.chain.read().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.mempool.lock().len()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.mempool.lock().snapshot()
    }

    pub fn last_confirmed_nonce(&self, sender: &PublicKey) -> Option<u64> {
        self.nonces.read().last_confirmed(&sender.address())
    }

    pub fn consensus(&self) -> &dyn ConsensusStrategy {
        self.consensus.as_ref()
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Test hook: overwrites a stored block without any checks.
    #[cfg(test)]
    pub(crate) fn tamper_block(&self, index: usize, f: impl FnOnce(&mut Block)) {
        if let Some(block) = self.chain.write().get_mut(index) {
            f(block);
        }
    }
}
