//! Cryptographic operations for the audit chain
//!
//! This module provides:
//! - SHA-256 hashing with unambiguous field framing for chain entries
//! - Ed25519 key pairs for optional signing of chain hashes
//! - UUIDv7 generation for time-ordered ids

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Ed25519 key pair for signing chain hashes
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from a hex-encoded 32-byte seed
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| Error::Config(format!("Signing seed is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("Signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message, returning the hex-encoded signature
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Verify a hex-encoded signature with a public key
pub fn verify_signature(message: &[u8], signature: &str, public_key: &[u8; 32]) -> bool {
    let bytes: [u8; 64] = match hex::decode(signature).ok().and_then(|b| b.try_into().ok()) {
        Some(bytes) => bytes,
        None => return false,
    };

    let verifying_key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key
        .verify(message, &Signature::from_bytes(&bytes))
        .is_ok()
}

/// SHA-256 over a sequence of length-prefixed fields
///
/// Each field is framed as `len (u64 BE) || bytes`, and absent optional fields
/// are framed with a distinct marker, so two different field lists never
/// produce the same input stream.
#[derive(Debug, Clone, Default)]
pub struct FieldHasher {
    hasher: Sha256,
}

impl FieldHasher {
    /// Empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one field
    pub fn field(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.hasher.update([1u8]);
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value);
        self
    }

    /// Append an optional field
    pub fn optional<T: AsRef<[u8]>>(&mut self, value: Option<T>) -> &mut Self {
        match value {
            Some(value) => self.field(value),
            None => {
                self.hasher.update([0u8]);
                self
            }
        }
    }

    /// Finish and hex-encode the digest
    pub fn finish_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

/// Generate a UUIDv7
///
/// UUIDv7 embeds timestamp for time-ordering while maintaining uniqueness
pub fn generate_uuid_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
