use crate::crypto::PublicKey;
use crate::error::{ChainError, Result};
use crate::transaction::Params;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Contract state; sorted keys keep its serialization canonical.
pub type ContractState = BTreeMap<String, Value>;

/// Call context handed to every action.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub contract: &'a str,
    pub owner: &'a PublicKey,
    pub caller: &'a PublicKey,
    pub block_number: u64,
}

impl ActionContext<'_> {
    fn require_owner(&self, action: &str) -> Result<()> {
        if self.caller != self.owner {
            return Err(ChainError::UnauthorizedAction(format!(
                "{} on {} is restricted to the contract owner",
                action, self.contract
            )));
        }
        Ok(())
    }
}

pub type ActionFn = fn(&mut ContractState, &ActionContext<'_>, &Params) -> Result<()>;

/// Name to entry point table for one contract kind.
#[derive(Default)]
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, ActionFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &'static str, action: ActionFn) -> Self {
        self.actions.insert(name, action);
        self
    }

    pub fn get(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.actions.keys().copied()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.actions.keys()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    /// String keyed document store.
    KeyValue,
    /// Fungible balances with an owner-controlled supply.
    Token,
}

static KEY_VALUE_ACTIONS: Lazy<ActionRegistry> = Lazy::new(|| {
    ActionRegistry::new()
        .register("set", kv_set)
        .register("remove", kv_remove)
        .register("clear", kv_clear)
});

static TOKEN_ACTIONS: Lazy<ActionRegistry> = Lazy::new(|| {
    ActionRegistry::new()
        .register("mint", token_mint)
        .register("transfer", token_transfer)
});

impl ContractKind {
    pub fn registry(self) -> &'static ActionRegistry {
        match self {
            ContractKind::KeyValue => &KEY_VALUE_ACTIONS,
            ContractKind::Token => &TOKEN_ACTIONS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ContractKind::KeyValue => "key_value",
            ContractKind::Token => "token",
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ContractKind {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "key_value" | "kv" => Ok(ContractKind::KeyValue),
            "token" => Ok(ContractKind::Token),
            other => Err(ChainError::ContractExecution(format!("unknown contract kind '{}'", other))),
        }
    }
}

fn str_param<'p>(params: &'p Params, name: &str) -> Result<&'p str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ChainError::ContractExecution(format!("missing string parameter '{}'", name)))
}

fn u64_param(params: &Params, name: &str) -> Result<u64> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| ChainError::ContractExecution(format!("missing integer parameter '{}'", name)))
}

fn kv_set(state: &mut ContractState, _ctx: &ActionContext<'_>, params: &Params) -> Result<()> {
    let key = str_param(params, "key")?;
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| ChainError::ContractExecution("missing parameter 'value'".to_string()))?;
    state.insert(key.to_string(), value);
    Ok(())
}

fn kv_remove(state: &mut ContractState, _ctx: &ActionContext<'_>, params: &Params) -> Result<()> {
    let key = str_param(params, "key")?;
    if state.remove(key).is_none() {
        return Err(ChainError::ContractExecution(format!("key '{}' is not set", key)));
    }
    Ok(())
}

fn kv_clear(state: &mut ContractState, ctx: &ActionContext<'_>, _params: &Params) -> Result<()> {
    ctx.require_owner("clear")?;
    state.clear();
    Ok(())
}

const TOTAL_SUPPLY: &str = "total_supply";

fn balance_key(address: &str) -> String {
    format!("balance:{}", address)
}

fn balance_of(state: &ContractState, address: &str) -> u64 {
    state.get(&balance_key(address)).and_then(Value::as_u64).unwrap_or(0)
}

fn set_balance(state: &mut ContractState, address: &str, amount: u64) {
    if amount == 0 {
        state.remove(&balance_key(address));
    } else {
        state.insert(balance_key(address), Value::from(amount));
    }
}

fn token_mint(state: &mut ContractState, ctx: &ActionContext<'_>, params: &Params) -> Result<()> {
    ctx.require_owner("mint")?;
    let to = str_param(params, "to")?;
    let amount = u64_param(params, "amount")?;

    let supply = state
        .get(TOTAL_SUPPLY)
        .and_then(Value::as_u64)
        .unwrap_or(0)
        .checked_add(amount)
        .ok_or_else(|| ChainError::ContractExecution("total supply overflow".to_string()))?;
    let balance = balance_of(state, to)
        .checked_add(amount)
        .ok_or_else(|| ChainError::ContractExecution("balance overflow".to_string()))?;

    state.insert(TOTAL_SUPPLY.to_string(), Value::from(supply));
    set_balance(state, to, balance);
    Ok(())
}

fn token_transfer(state: &mut ContractState, ctx: &ActionContext<'_>, params: &Params) -> Result<()> {
    let from = ctx.caller.address();
    let to = str_param(params, "to")?;
    let amount = u64_param(params, "amount")?;

    let available = balance_of(state, &from);
    if amount > available {
        return Err(ChainError::ContractExecution(format!(
            "insufficient balance: {} available, {} requested",
            available, amount
        )));
    }
    if from == to {
        return Ok(());
    }

    let credited = balance_of(state, to)
        .checked_add(amount)
        .ok_or_else(|| ChainError::ContractExecution("balance overflow".to_string()))?;
    set_balance(state, &from, available - amount);
    set_balance(state, to, credited);
    Ok(())
}
