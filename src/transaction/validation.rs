/// Validation logic for transactions separated from type definitions
use crate::crypto;
use crate::error::ChainError;
use crate::transaction::types::{ContractCall, Transaction};

impl ContractCall {
    /// Checks the call signature against `caller`.
    pub fn verify(&self, caller: &crypto::PublicKey) -> bool {
        match &self.signature {
            Some(signature) => crypto::verify(caller, &self.signable_message(), signature),
            None => false,
        }
    }
}

impl Transaction {
    /// Signature check over the canonical encoding. Never errors; any failure is `false`.
    pub fn verify(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        if !crypto::verify(&self.sender, &self.signable_message(), signature) {
            return false;
        }
        match &self.contract_call {
            Some(call) => call.verify(&self.sender),
            None => true,
        }
    }

    /// Stateless validation used on submission: signature first, then shape and size.
    pub fn validate(&self, max_size: usize) -> Result<(), ChainError> {
        if !self.verify() {
            return Err(ChainError::InvalidSignature);
        }

        if let Some(call) = &self.contract_call {
            if call.address.trim().is_empty() {
                return Err(ChainError::InvalidTransaction(
                    "Contract call address cannot be empty".to_string(),
                ));
            }
            if call.action.trim().is_empty() {
                return Err(ChainError::InvalidTransaction(
                    "Contract call action cannot be empty".to_string(),
                ));
            }
        }

        self.validate_size(max_size)
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self, max_size: usize) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > max_size {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                max_size
            )));
        }
        Ok(())
    }
}
