// Chain data, ledger bookkeeping and block validation.
pub mod chain;
pub mod state;
pub mod validation;

pub use chain::*;
pub use state::*;
