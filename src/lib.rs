//! QRLedger - a minimal hash-linked ledger with pluggable consensus and
//! programmable contract state
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, the ledger and chain validation
//! - [`transaction`] - Signed transfers and contract calls
//! - [`mempool`] - Pending transaction pool
//!
//! ## Consensus
//! - [`consensus`] - Proof-of-work and proof-of-stake strategies
//!
//! ## Contracts
//! - [`contracts`] - Action registries and the execution engine
//!
//! ## Cryptography
//! - [`crypto`] - Signatures (secp256k1, ed25519), X25519 key exchange,
//!   AES-256-GCM and sealed payloads
//!
//! ## State Management
//! - [`persistence`] - Content-addressed state stores (memory, SQLite)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;

// ============================================================================
// Contracts
// ============================================================================
pub mod contracts;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use blockchain::{Block, Ledger, MineOutcome};
pub use error::{ChainError, Result};
