//! Programmable per-address state
//!
//! Contracts are instances of a built-in [`ContractKind`]; each kind exposes a
//! fixed table of named actions. Calls arrive from transactions during block
//! assembly or directly through [`ContractEngine::execute`].

pub mod engine;
pub mod registry;

pub use engine::{
    ContentAddressed, ContractAccount, ContractEngine, ContractEvent, Ephemeral, EventOutcome,
    StagedCalls, StagedChanges, StatePersistence,
};
pub use registry::{ActionContext, ActionFn, ActionRegistry, ContractKind, ContractState};
