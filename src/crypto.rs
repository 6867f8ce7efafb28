//! Cryptographic primitives for QRLedger
//!
//! Signing (secp256k1 ECDSA, Ed25519), X25519 key exchange with HKDF-SHA256
//! key derivation, and AES-256-GCM authenticated encryption. Everything here
//! is stateless: functions take keys and byte buffers and return new values.

use crate::error::{ChainError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use ed25519_dalek::{Signer as _, Verifier as _};
use hkdf::Hkdf;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{ecdsa::Signature as EcdsaSignature, All, Message, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Info string bound into every HKDF expansion.
const KDF_INFO: &[u8] = b"qrledger shared key v1";

pub const SYMMETRIC_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const X25519_KEY_SIZE: usize = 32;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];
pub type AeadNonce = [u8; NONCE_SIZE];

/// SHA-256 of an arbitrary byte buffer.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Scheme {
    Secp256k1 = 1,
    Ed25519 = 2,
    X25519 = 3,
}

impl Scheme {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Scheme::Secp256k1 => "secp256k1",
            Scheme::Ed25519 => "ed25519",
            Scheme::X25519 => "x25519",
        }
    }

    /// Whether keys of this scheme can produce signatures.
    pub fn can_sign(self) -> bool {
        matches!(self, Scheme::Secp256k1 | Scheme::Ed25519)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scheme {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secp256k1" => Ok(Scheme::Secp256k1),
            "ed25519" => Ok(Scheme::Ed25519),
            "x25519" | "curve25519" => Ok(Scheme::X25519),
            other => Err(ChainError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl TryFrom<u8> for Scheme {
    type Error = ChainError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Scheme::Secp256k1),
            2 => Ok(Scheme::Ed25519),
            3 => Ok(Scheme::X25519),
            other => Err(ChainError::UnsupportedScheme(format!("scheme id {}", other))),
        }
    }
}

/// A validated public key tagged with its scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey {
    scheme: Scheme,
    bytes: Vec<u8>,
}

impl PublicKey {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Hex SHA-256 of the key bytes; used wherever a short stable identifier is needed.
    pub fn address(&self) -> String {
        hex::encode(sha256(&self.bytes))
    }

    /// Order-stable encoding used inside signable messages: scheme id, u32 LE length, bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.bytes.len());
        out.push(self.scheme.id());
        out.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.to_hex())
    }
}

/// Private key material. Never printed.
#[derive(Clone)]
pub struct SecretKey {
    scheme: Scheme,
    bytes: Vec<u8>,
}

impl SecretKey {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({}, <redacted>)", self.scheme)
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate(scheme: Scheme) -> Result<Self> {
        generate_keypair(scheme)
    }

    /// Rebuilds a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(scheme: Scheme, bytes: &[u8]) -> Result<Self> {
        let public = match scheme {
            Scheme::Secp256k1 => {
                let sk = secp256k1::SecretKey::from_slice(bytes)
                    .map_err(|e| ChainError::InvalidKey(format!("Invalid secp256k1 secret key: {}", e)))?;
                secp256k1::PublicKey::from_secret_key(&SECP256K1_CONTEXT, &sk)
                    .serialize()
                    .to_vec()
            }
            Scheme::Ed25519 => {
                let sk = ed25519_dalek::SigningKey::from_bytes(&fixed_32(bytes, "Ed25519 secret key")?);
                sk.verifying_key().to_bytes().to_vec()
            }
            Scheme::X25519 => {
                let sk = x25519_dalek::StaticSecret::from(fixed_32(bytes, "X25519 secret key")?);
                x25519_dalek::PublicKey::from(&sk).as_bytes().to_vec()
            }
        };

        Ok(KeyPair {
            public: PublicKey { scheme, bytes: public },
            secret: SecretKey {
                scheme,
                bytes: bytes.to_vec(),
            },
        })
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        sign(&self.secret, message)
    }
}

fn fixed_32(bytes: &[u8], what: &str) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| ChainError::InvalidKey(format!("{} must be 32 bytes, got {}", what, bytes.len())))
}

/// Generates a key pair for the given scheme.
pub fn generate_keypair(scheme: Scheme) -> Result<KeyPair> {
    match scheme {
        Scheme::Secp256k1 => {
            let sk = secp256k1::SecretKey::new(&mut OsRng);
            KeyPair::from_secret_bytes(scheme, &sk.secret_bytes())
        }
        Scheme::Ed25519 => {
            let sk = ed25519_dalek::SigningKey::generate(&mut OsRng);
            KeyPair::from_secret_bytes(scheme, sk.as_bytes())
        }
        Scheme::X25519 => {
            let sk = x25519_dalek::StaticSecret::random_from_rng(OsRng);
            KeyPair::from_secret_bytes(scheme, sk.as_bytes())
        }
    }
}

/// Parses a scheme name and generates a key pair for it.
pub fn generate_keypair_named(scheme: &str) -> Result<KeyPair> {
    generate_keypair(scheme.parse()?)
}

/// Signs `message`. secp256k1 signs the SHA-256 digest and returns the 64-byte compact form.
pub fn sign(secret: &SecretKey, message: &[u8]) -> Result<Vec<u8>> {
    match secret.scheme {
        Scheme::Secp256k1 => {
            let sk = secp256k1::SecretKey::from_slice(&secret.bytes)
                .map_err(|e| ChainError::InvalidKey(format!("Invalid secp256k1 secret key: {}", e)))?;
            let message = Message::from_digest(sha256(message));
            Ok(SECP256K1_CONTEXT
                .sign_ecdsa(&message, &sk)
                .serialize_compact()
                .to_vec())
        }
        Scheme::Ed25519 => {
            let sk = ed25519_dalek::SigningKey::from_bytes(&fixed_32(&secret.bytes, "Ed25519 secret key")?);
            Ok(sk.sign(message).to_bytes().to_vec())
        }
        Scheme::X25519 => Err(ChainError::UnsupportedScheme(
            "x25519 keys cannot sign".to_string(),
        )),
    }
}

/// Verifies a signature. Malformed keys or signatures yield `false`, never an error.
pub fn verify(public: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    match public.scheme {
        Scheme::Secp256k1 => {
            let Ok(pk) = secp256k1::PublicKey::from_slice(&public.bytes) else {
                return false;
            };
            let Ok(sig) = EcdsaSignature::from_compact(signature) else {
                return false;
            };
            let message = Message::from_digest(sha256(message));
            SECP256K1_CONTEXT.verify_ecdsa(&message, &sig, &pk).is_ok()
        }
        Scheme::Ed25519 => {
            let Ok(key_bytes) = <[u8; 32]>::try_from(public.bytes.as_slice()) else {
                return false;
            };
            let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes) else {
                return false;
            };
            let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
                return false;
            };
            vk.verify(message, &sig).is_ok()
        }
        Scheme::X25519 => false,
    }
}

/// X25519 exchange followed by HKDF-SHA256 (no salt, fixed info string).
pub fn derive_shared_key(my_secret: &SecretKey, their_public: &PublicKey) -> Result<SymmetricKey> {
    if my_secret.scheme != Scheme::X25519 || their_public.scheme != Scheme::X25519 {
        return Err(ChainError::InvalidKey(
            "Key exchange requires x25519 keys on both sides".to_string(),
        ));
    }

    let secret = x25519_dalek::StaticSecret::from(fixed_32(&my_secret.bytes, "X25519 secret key")?);
    let public = x25519_dalek::PublicKey::from(fixed_32(&their_public.bytes, "X25519 public key")?);
    let shared = secret.diffie_hellman(&public);
    if !shared.was_contributory() {
        return Err(ChainError::InvalidKey(
            "X25519 public key is a low-order point".to_string(),
        ));
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; SYMMETRIC_KEY_SIZE];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|e| ChainError::CryptoError(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// AES-256-GCM encryption under a fresh random 12-byte nonce.
///
/// Nonces are random, so a single key should not be used for more than
/// roughly 2^32 messages before rotation.
pub fn authenticated_encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<(Vec<u8>, AeadNonce)> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ChainError::CryptoError(format!("Invalid AES key: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| ChainError::CryptoError("Encryption failed".to_string()))?;
    Ok((ciphertext, nonce_bytes))
}

/// Reverses [`authenticated_encrypt`]. Any tag failure is reported as a bare `DecryptionError`.
pub fn authenticated_decrypt(key: &SymmetricKey, ciphertext: &[u8], nonce: &AeadNonce) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ChainError::DecryptionError)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ChainError::DecryptionError)
}

/// Accepts a hex or base64 encoded key and validates it for `scheme`.
pub fn validate_public_key(scheme: Scheme, input: &str) -> Result<PublicKey> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let decoded = if !trimmed.is_empty() && trimmed.len() % 2 == 0 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(trimmed).map_err(|e| ChainError::InvalidKey(format!("Invalid hex key: {}", e)))?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(trimmed)
            .map_err(|e| ChainError::InvalidKey(format!("Key is neither hex nor base64: {}", e)))?
    };
    validate_public_key_bytes(scheme, &decoded)
}

/// Validates raw key bytes for `scheme`.
pub fn validate_public_key_bytes(scheme: Scheme, bytes: &[u8]) -> Result<PublicKey> {
    match scheme {
        Scheme::Secp256k1 => {
            let pk = secp256k1::PublicKey::from_slice(bytes)
                .map_err(|e| ChainError::InvalidKey(format!("Invalid secp256k1 public key: {}", e)))?;
            Ok(PublicKey {
                scheme,
                bytes: pk.serialize().to_vec(),
            })
        }
        Scheme::Ed25519 => {
            let key = fixed_32(bytes, "Ed25519 public key")?;
            ed25519_dalek::VerifyingKey::from_bytes(&key)
                .map_err(|e| ChainError::InvalidKey(format!("Invalid Ed25519 public key: {}", e)))?;
            Ok(PublicKey {
                scheme,
                bytes: key.to_vec(),
            })
        }
        Scheme::X25519 => {
            let key = fixed_32(bytes, "X25519 public key")?;
            if key == [0u8; X25519_KEY_SIZE] {
                return Err(ChainError::InvalidKey(
                    "X25519 public key cannot be all zeros".to_string(),
                ));
            }
            Ok(PublicKey {
                scheme,
                bytes: key.to_vec(),
            })
        }
    }
}

/// A payload encrypted to an X25519 recipient with an ephemeral sender key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub ephemeral_public: [u8; X25519_KEY_SIZE],
    pub ciphertext: Vec<u8>,
    pub nonce: AeadNonce,
}

impl SealedPayload {
    pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Self> {
        let ephemeral = generate_keypair(Scheme::X25519)?;
        let key = derive_shared_key(&ephemeral.secret, recipient)?;
        let (ciphertext, nonce) = authenticated_encrypt(&key, plaintext)?;
        Ok(SealedPayload {
            ephemeral_public: fixed_32(ephemeral.public.as_bytes(), "X25519 public key")?,
            ciphertext,
            nonce,
        })
    }

    pub fn open(&self, recipient_secret: &SecretKey) -> Result<Vec<u8>> {
        let ephemeral = validate_public_key_bytes(Scheme::X25519, &self.ephemeral_public)
            .map_err(|_| ChainError::DecryptionError)?;
        let key = derive_shared_key(recipient_secret, &ephemeral).map_err(|_| ChainError::DecryptionError)?;
        authenticated_decrypt(&key, &self.ciphertext, &self.nonce)
    }

    /// Digest committed to by a transaction signature.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.ephemeral_public);
        hasher.update(self.nonce);
        hasher.update(&self.ciphertext);
        hasher.finalize().into()
    }
}
