//! Configuration management for QRLedger

use crate::consensus::pow::MAX_DIFFICULTY;
use crate::error::ChainError;
use crate::transaction::MAX_TRANSACTION_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    #[default]
    Pow,
    Pos,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default)]
    pub kind: ConsensusKind,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_forger_reward")]
    pub forger_reward: u64,
    #[serde(default)]
    pub stakes: Vec<StakeEntry>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            kind: ConsensusKind::default(),
            difficulty: default_difficulty(),
            forger_reward: default_forger_reward(),
            stakes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_data_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_data_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_max_transaction_size")]
    pub max_transaction_size: usize,
    #[serde(default = "default_genesis_timestamp")]
    pub genesis_timestamp: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_transaction_size: default_max_transaction_size(),
            genesis_timestamp: default_genesis_timestamp(),
            max_pending: default_max_pending(),
        }
    }
}

fn default_difficulty() -> u32 {
    4
}

fn default_forger_reward() -> u64 {
    1
}

fn default_data_path() -> String {
    "./data/state.db".to_string()
}

fn default_max_transaction_size() -> usize {
    MAX_TRANSACTION_SIZE
}

fn default_genesis_timestamp() -> u64 {
    1672531200000
}

fn default_max_pending() -> usize {
    crate::mempool::DEFAULT_MAX_PENDING
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.consensus.difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "consensus.difficulty must be at most {}",
                MAX_DIFFICULTY
            )));
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.trim().is_empty() {
            return Err(ChainError::ConfigError(
                "storage.path must be set for the sqlite backend".to_string(),
            ));
        }

        if self.ledger.max_transaction_size == 0 {
            return Err(ChainError::ConfigError(
                "ledger.max_transaction_size must be positive".to_string(),
            ));
        }

        if self.consensus.kind == ConsensusKind::Pos {
            if let Some(entry) = self.consensus.stakes.iter().find(|s| s.amount == 0) {
                return Err(ChainError::ConfigError(format!(
                    "stake for {} must be positive",
                    entry.address
                )));
            }
            if self.consensus.stakes.is_empty() {
                return Err(ChainError::ConfigError(
                    "proof-of-stake requires at least one [[consensus.stakes]] entry".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Reads `path`; a missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let config_str = match fs::read_to_string(path.as_ref()) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    if config_str.trim().is_empty() {
        return Ok(Config::default());
    }
    Config::from_toml(&config_str)
}
