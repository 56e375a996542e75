//! Key material helpers
//!
//! API keys are handed to devices once and only their SHA-256 digest is
//! stored. Configuration documents are fingerprinted the same way so that
//! regeneration can be compared against what a device last received.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Number of random bytes in a freshly minted API key
pub const API_KEY_BYTES: usize = 32;

/// A freshly minted API key. The plaintext leaves the process exactly once.
pub struct MintedKey {
    pub plaintext: String,
    pub hash: String,
}

impl std::fmt::Debug for MintedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MintedKey").field("hash", &self.hash).finish()
    }
}

/// Generate a new URL-safe API key and its stored hash
pub fn mint_api_key() -> MintedKey {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let plaintext = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_api_key(&plaintext);
    MintedKey { plaintext, hash }
}

/// Hash a presented API key for lookup
pub fn hash_api_key(key: &str) -> String {
    sha256_hex(key.trim().as_bytes())
}

/// Hex-encoded SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_api_key() {
        let key = mint_api_key();
        assert_eq!(key.plaintext.len(), 43); // Base64 of 32 bytes, unpadded
        assert_eq!(key.hash, hash_api_key(&key.plaintext));
        assert_eq!(key.hash.len(), 64);

        let other = mint_api_key();
        assert_ne!(key.plaintext, other.plaintext);
    }

    #[test]
    fn test_debug_hides_plaintext() {
        let key = mint_api_key();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains(&key.plaintext));
    }

    #[test]
    fn test_hash_ignores_surrounding_whitespace() {
        assert_eq!(hash_api_key("abc\n"), hash_api_key("abc"));
    }
}
