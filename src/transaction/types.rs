/// Transaction types for QRLedger
use crate::crypto::{self, KeyPair, PublicKey, SealedPayload, SecretKey};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

const TX_DOMAIN: &[u8] = b"QRL-TX:";
const CALL_DOMAIN: &[u8] = b"QRL-CALL:";

/// Named arguments passed to a contract action. Keys serialize in sorted order.
pub type Params = serde_json::Map<String, serde_json::Value>;

fn push_str(message: &mut Vec<u8>, s: &str) {
    message.extend_from_slice(&(s.len() as u32).to_le_bytes());
    message.extend_from_slice(s.as_bytes());
}

/// Invocation of a deployed contract carried by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    pub address: String,
    pub action: String,
    pub params: Params,
    /// Sender's signature over [`ContractCall::signable_message`].
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

impl ContractCall {
    pub fn new(address: impl Into<String>, action: impl Into<String>, params: Params) -> Self {
        ContractCall {
            address: address.into(),
            action: action.into(),
            params,
            signature: None,
        }
    }

    /// Canonical call encoding; excludes the signature.
    pub fn signable_message(&self) -> Vec<u8> {
        Self::encode(&self.address, &self.action, &self.params)
    }

    pub fn encode(address: &str, action: &str, params: &Params) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(CALL_DOMAIN);
        push_str(&mut message, address);
        push_str(&mut message, action);
        // serde_json::Map is a BTreeMap here, so this is key-sorted compact JSON.
        let params_json = serde_json::Value::Object(params.clone()).to_string();
        push_str(&mut message, &params_json);
        message
    }

    pub fn sign(&mut self, secret: &SecretKey) -> Result<(), ChainError> {
        self.signature = Some(crypto::sign(secret, &self.signable_message())?);
        Ok(())
    }
}

/// A signed value transfer, optionally carrying a contract call and a sealed memo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: PublicKey,
    pub recipient: PublicKey,
    pub amount: u64,
    /// Replay guard; strictly increasing per sender across confirmed blocks.
    pub nonce: u64,
    #[serde(default)]
    pub contract_call: Option<ContractCall>,
    /// Payload encrypted to the recipient's X25519 key.
    #[serde(default)]
    pub memo: Option<SealedPayload>,
    pub signature: Option<Vec<u8>>,
}

impl Transaction {
    pub fn new(sender: PublicKey, recipient: PublicKey, amount: u64, nonce: u64) -> Self {
        Transaction {
            sender,
            recipient,
            amount,
            nonce,
            contract_call: None,
            memo: None,
            signature: None,
        }
    }

    pub fn with_contract_call(mut self, call: ContractCall) -> Self {
        self.contract_call = Some(call);
        self.signature = None;
        self
    }

    /// Seals `plaintext` to `recipient_exchange_key` (an x25519 key) and attaches it.
    pub fn with_sealed_memo(mut self, recipient_exchange_key: &PublicKey, plaintext: &[u8]) -> Result<Self, ChainError> {
        self.memo = Some(SealedPayload::seal(recipient_exchange_key, plaintext)?);
        self.signature = None;
        Ok(self)
    }

    pub fn is_contract_call(&self) -> bool {
        self.contract_call.is_some()
    }

    /// Stable identifier of the sender used by the nonce index.
    pub fn sender_address(&self) -> String {
        self.sender.address()
    }

    /// Canonical encoding of every field except the signatures.
    pub fn signable_message(&self) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(TX_DOMAIN);
        message.extend_from_slice(&self.sender.canonical_bytes());
        message.extend_from_slice(&self.recipient.canonical_bytes());
        message.extend_from_slice(&self.amount.to_le_bytes());
        message.extend_from_slice(&self.nonce.to_le_bytes());
        match &self.contract_call {
            Some(call) => {
                message.push(1);
                message.extend_from_slice(&call.signable_message());
            }
            None => message.push(0),
        }
        match &self.memo {
            Some(memo) => {
                message.push(1);
                message.extend_from_slice(&memo.digest());
            }
            None => message.push(0),
        }
        message
    }

    /// Signs the transaction (and its contract call, if any) with the sender's key.
    pub fn sign(&mut self, secret: &SecretKey) -> Result<(), ChainError> {
        let keypair = KeyPair::from_secret_bytes(secret.scheme(), secret.as_bytes())?;
        if keypair.public != self.sender {
            return Err(ChainError::InvalidKey(
                "Signing key does not match transaction sender".to_string(),
            ));
        }

        if let Some(call) = self.contract_call.as_mut() {
            call.sign(secret)?;
        }
        self.signature = Some(crypto::sign(secret, &self.signable_message())?);
        Ok(())
    }

    /// Calculate the hash of this transaction, signatures included.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.signable_message());
        if let Some(signature) = &self.signature {
            hasher.update(signature);
        }
        if let Some(signature) = self.contract_call.as_ref().and_then(|c| c.signature.as_ref()) {
            hasher.update(signature);
        }
        hasher.finalize().into()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }
}
