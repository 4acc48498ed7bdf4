//! Keys, signatures and hash derivations.
//!
//! Message ids use SHA-256; the network id uses BLAKE3 with a domain prefix.

use crate::error::VerifyError;
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Domain prefix for NetworkId derivation
pub const DOMAIN_NETWORK: &[u8] = b"kit-network";

/// Network phrase used when none is configured.
pub const DEFAULT_NETWORK_PHRASE: &str = "kit";

// =============================================================================
// NETWORK IDENTITY
// =============================================================================

/// Normalize a network phrase: lowercase, trim, collapse whitespace to single hyphen.
pub fn normalize_network_phrase(phrase: &str) -> String {
    phrase
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// `NetworkId = BLAKE3("kit-network" || phrase_norm)`
pub fn derive_network_id(phrase: &str) -> NetworkId {
    let phrase_norm = normalize_network_phrase(phrase);
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_NETWORK);
    hasher.update(phrase_norm.as_bytes());
    NetworkId(*hasher.finalize().as_bytes())
}

/// SHA-256 content address.
pub fn hash_id(bytes: &[u8]) -> MsgId {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    MsgId(out)
}

/// Current time in Unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// KEYS
// =============================================================================

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Seed bytes, as persisted in the workspace key file.
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn user_id(&self) -> UserId {
        UserId(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Verify `signature` over `message` under `author`.
    pub fn verify(
        author: &UserId,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), VerifyError> {
        let key = VerifyingKey::from_bytes(author.as_bytes())
            .map_err(|_| VerifyError::InvalidPublicKey(*author))?;
        let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        key.verify(message, &sig)
            .map_err(|_| VerifyError::BadSignature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("user", &self.user_id())
            .finish_non_exhaustive()
    }
}
