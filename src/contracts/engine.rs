use super::registry::{ActionContext, ContractKind, ContractState};
use crate::blockchain::Sha256Hash;
use crate::crypto::{self, sha256, PublicKey};
use crate::error::{ChainError, Result};
use crate::persistence::StateStore;
use crate::transaction::{ContractCall, Params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a contract's serialized states go after each successful action.
pub trait StatePersistence: Send + Sync {
    fn persist(&self, hash: &Sha256Hash, serialized: &[u8]) -> Result<()>;
    fn load(&self, hash: &Sha256Hash) -> Result<Option<Vec<u8>>>;
}

/// Writes every state into a content-addressed store, keeping history addressable.
#[derive(Clone)]
pub struct ContentAddressed {
    store: Arc<dyn StateStore>,
}

impl ContentAddressed {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        ContentAddressed { store }
    }
}

impl StatePersistence for ContentAddressed {
    fn persist(&self, hash: &Sha256Hash, serialized: &[u8]) -> Result<()> {
        self.store.put(hash, serialized)
    }

    fn load(&self, hash: &Sha256Hash) -> Result<Option<Vec<u8>>> {
        self.store.get(hash)
    }
}

/// Keeps only the live state in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ephemeral;

impl StatePersistence for Ephemeral {
    fn persist(&self, _hash: &Sha256Hash, _serialized: &[u8]) -> Result<()> {
        Ok(())
    }

    fn load(&self, _hash: &Sha256Hash) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied { state_hash: Sha256Hash },
    /// The call changed nothing.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub contract: String,
    pub action: String,
    pub params: Params,
    pub block_number: u64,
    pub outcome: EventOutcome,
}

pub fn state_hash(state: &ContractState) -> Result<(Sha256Hash, Vec<u8>)> {
    let serialized = serde_json::to_vec(state)?;
    Ok((sha256(&serialized), serialized))
}

#[derive(Clone)]
pub struct ContractAccount {
    pub address: String,
    pub owner: PublicKey,
    pub kind: ContractKind,
    state: ContractState,
    state_hash: Sha256Hash,
    /// Every state hash this account has held, oldest first.
    history: Vec<Sha256Hash>,
    persistence: Arc<dyn StatePersistence>,
}

impl ContractAccount {
    pub fn state(&self) -> &ContractState {
        &self.state
    }

    pub fn state_hash(&self) -> Sha256Hash {
        self.state_hash
    }

    pub fn history(&self) -> &[Sha256Hash] {
        &self.history
    }
}

impl fmt::Debug for ContractAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractAccount")
            .field("address", &self.address)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("state_hash", &hex::encode(self.state_hash))
            .field("entries", &self.state.len())
            .finish()
    }
}

/// Owns every deployed contract and the shared event log.
#[derive(Debug, Clone, Default)]
pub struct ContractEngine {
    accounts: BTreeMap<String, ContractAccount>,
    events: Vec<ContractEvent>,
}

impl ContractEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(
        &mut self,
        address: &str,
        owner: PublicKey,
        kind: ContractKind,
        persistence: Arc<dyn StatePersistence>,
    ) -> Result<Sha256Hash> {
        if address.trim().is_empty() {
            return Err(ChainError::ContractExecution("contract address cannot be empty".to_string()));
        }
        if self.accounts.contains_key(address) {
            return Err(ChainError::ContractAlreadyExists(address.to_string()));
        }

        let state = ContractState::new();
        let (hash, serialized) = state_hash(&state)?;
        persistence.persist(&hash, &serialized)?;

        self.accounts.insert(
            address.to_string(),
            ContractAccount {
                address: address.to_string(),
                owner,
                kind,
                state,
                state_hash: hash,
                history: vec![hash],
                persistence,
            },
        );
        debug!("Deployed {} contract at {}", kind, address);
        Ok(hash)
    }

    /// Runs `action` on the contract at `address` on behalf of `caller`.
    ///
    /// `signature` must be the caller's signature over
    /// [`ContractCall::encode`] of the same address, action and params. The
    /// action body runs against a copy of the state; the copy is persisted and
    /// committed, and the event logged, only after the body succeeds. Any error
    /// leaves the account and the event log unchanged.
    pub fn execute(
        &mut self,
        address: &str,
        action: &str,
        params: &Params,
        caller: &PublicKey,
        signature: &[u8],
        block_number: u64,
    ) -> Result<Sha256Hash> {
        let account = self
            .accounts
            .get_mut(address)
            .ok_or_else(|| ChainError::UnknownContract(address.to_string()))?;

        let (next, hash) = run_action(account, &account.state, action, params, caller, signature, block_number)?;
        account.state = next;
        account.state_hash = hash;
        account.history.push(hash);
        self.events.push(applied_event(address, action, params, block_number, hash));
        Ok(hash)
    }

    /// Executes a transaction-borne call signed by `caller`.
    pub fn execute_call(&mut self, call: &ContractCall, caller: &PublicKey, block_number: u64) -> Result<Sha256Hash> {
        let signature = call_signature(call)?;
        self.execute(&call.address, &call.action, &call.params, caller, signature, block_number)
    }

    /// Logs a call that was skipped during block assembly.
    pub fn record_rejection(&mut self, call: &ContractCall, block_number: u64, reason: &ChainError) {
        self.events.push(rejected_event(call, block_number, reason));
    }

    pub fn account(&self, address: &str) -> Option<&ContractAccount> {
        self.accounts.get(address)
    }

    pub fn state_of(&self, address: &str) -> Option<&ContractState> {
        self.accounts.get(address).map(|a| &a.state)
    }

    /// Looks up a historical state of `address` by its content hash.
    pub fn state_at(&self, address: &str, hash: &Sha256Hash) -> Result<Option<ContractState>> {
        let account = self
            .accounts
            .get(address)
            .ok_or_else(|| ChainError::UnknownContract(address.to_string()))?;

        if *hash == account.state_hash {
            return Ok(Some(account.state.clone()));
        }
        match account.persistence.load(hash)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn events(&self) -> &[ContractEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Digest over every account's address and current state hash, in address
    /// order. All zero when nothing is deployed.
    pub fn state_root(&self) -> Sha256Hash {
        root_of(self.accounts.iter().map(|(address, account)| (address.as_str(), &account.state_hash)))
    }

    /// Overlay for applying a block's calls without touching this engine.
    pub fn stage(&self) -> StagedCalls<'_> {
        StagedCalls {
            engine: self,
            touched: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Applies the changes of a finished overlay.
    pub fn commit(&mut self, changes: StagedChanges) {
        for (address, pending) in changes.touched {
            if let Some(account) = self.accounts.get_mut(&address) {
                account.state = pending.state;
                account.state_hash = pending.state_hash;
                account.history.extend(pending.appended);
            }
        }
        self.events.extend(changes.events);
    }
}

#[derive(Debug, Clone)]
struct PendingState {
    state: ContractState,
    state_hash: Sha256Hash,
    /// State hashes produced by this overlay, oldest first.
    appended: Vec<Sha256Hash>,
}

/// Calls applied on top of a borrowed engine. Only the accounts a call
/// writes are copied.
pub struct StagedCalls<'e> {
    engine: &'e ContractEngine,
    touched: BTreeMap<String, PendingState>,
    events: Vec<ContractEvent>,
}

impl StagedCalls<'_> {
    pub fn execute_call(&mut self, call: &ContractCall, caller: &PublicKey, block_number: u64) -> Result<Sha256Hash> {
        let account = self
            .engine
            .accounts
            .get(&call.address)
            .ok_or_else(|| ChainError::UnknownContract(call.address.clone()))?;
        let signature = call_signature(call)?;
        let current = match self.touched.get(&call.address) {
            Some(pending) => &pending.state,
            None => &account.state,
        };

        let (next, hash) = run_action(
            account,
            current,
            &call.action,
            &call.params,
            caller,
            signature,
            block_number,
        )?;
        match self.touched.get_mut(&call.address) {
            Some(pending) => {
                pending.state = next;
                pending.state_hash = hash;
                pending.appended.push(hash);
            }
            None => {
                self.touched.insert(
                    call.address.clone(),
                    PendingState {
                        state: next,
                        state_hash: hash,
                        appended: vec![hash],
                    },
                );
            }
        }
        self.events
            .push(applied_event(&call.address, &call.action, &call.params, block_number, hash));
        Ok(hash)
    }

    pub fn record_rejection(&mut self, call: &ContractCall, block_number: u64, reason: &ChainError) {
        self.events.push(rejected_event(call, block_number, reason));
    }

    /// State root the engine would have after committing this overlay.
    pub fn state_root(&self) -> Sha256Hash {
        root_of(self.engine.accounts.iter().map(|(address, account)| {
            let hash = self
                .touched
                .get(address)
                .map_or(&account.state_hash, |pending| &pending.state_hash);
            (address.as_str(), hash)
        }))
    }

    pub fn events(&self) -> &[ContractEvent] {
        &self.events
    }

    pub fn finish(self) -> StagedChanges {
        StagedChanges {
            touched: self.touched,
            events: self.events,
        }
    }
}

/// Owned result of a [`StagedCalls`] overlay, ready for [`ContractEngine::commit`].
#[derive(Debug)]
pub struct StagedChanges {
    touched: BTreeMap<String, PendingState>,
    events: Vec<ContractEvent>,
}

fn call_signature(call: &ContractCall) -> Result<&[u8]> {
    call.signature.as_deref().ok_or_else(|| {
        ChainError::UnauthorizedAction(format!("call to {}.{} is unsigned", call.address, call.action))
    })
}

/// Checks the caller's signature, runs the action body on a copy of
/// `current` and persists the result. Nothing is committed here.
fn run_action(
    account: &ContractAccount,
    current: &ContractState,
    action: &str,
    params: &Params,
    caller: &PublicKey,
    signature: &[u8],
    block_number: u64,
) -> Result<(ContractState, Sha256Hash)> {
    let address = account.address.as_str();
    let message = ContractCall::encode(address, action, params);
    if !crypto::verify(caller, &message, signature) {
        return Err(ChainError::UnauthorizedAction(format!(
            "signature on {}.{} does not verify for caller",
            address, action
        )));
    }

    let entry = account
        .kind
        .registry()
        .get(action)
        .ok_or_else(|| ChainError::UnknownAction(format!("{} has no action '{}'", account.kind, action)))?;

    let mut next = current.clone();
    let ctx = ActionContext {
        contract: address,
        owner: &account.owner,
        caller,
        block_number,
    };
    entry(&mut next, &ctx, params)?;

    let (hash, serialized) = state_hash(&next)?;
    account.persistence.persist(&hash, &serialized)?;
    Ok((next, hash))
}

fn applied_event(address: &str, action: &str, params: &Params, block_number: u64, hash: Sha256Hash) -> ContractEvent {
    ContractEvent {
        contract: address.to_string(),
        action: action.to_string(),
        params: params.clone(),
        block_number,
        outcome: EventOutcome::Applied { state_hash: hash },
    }
}

fn rejected_event(call: &ContractCall, block_number: u64, reason: &ChainError) -> ContractEvent {
    warn!("Contract call {}.{} rejected: {}", call.address, call.action, reason);
    ContractEvent {
        contract: call.address.clone(),
        action: call.action.clone(),
        params: call.params.clone(),
        block_number,
        outcome: EventOutcome::Rejected {
            reason: reason.to_string(),
        },
    }
}

fn root_of<'a>(entries: impl ExactSizeIterator<Item = (&'a str, &'a Sha256Hash)>) -> Sha256Hash {
    if entries.len() == 0 {
        return [0u8; 32];
    }
    let mut buf = Vec::with_capacity(entries.len() * 72);
    for (address, hash) in entries {
        buf.extend_from_slice(&(address.len() as u32).to_le_bytes());
        buf.extend_from_slice(address.as_bytes());
        buf.extend_from_slice(hash);
    }
    sha256(&buf)
}
