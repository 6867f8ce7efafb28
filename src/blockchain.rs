// Thin re-export module: blocks, the ledger and its validation rules live
// under `blockchain/core/`.

pub mod core;
pub use core::*;
