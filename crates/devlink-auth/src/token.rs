//! Credential minting and hashing

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

/// One-way transform applied to credentials before they are stored
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, credential: &str) -> String;
}

/// SHA-256, base64 encoded
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl CredentialHasher for Sha256Hasher {
    fn hash(&self, credential: &str) -> String {
        hash_token(credential)
    }
}

/// Generate a secure random bearer credential
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    BASE64.encode(bytes)
}

/// Hash a token for storage
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    BASE64.encode(result)
}
