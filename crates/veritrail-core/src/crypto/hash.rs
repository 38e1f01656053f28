//! SHA-256 hashing and hash-chain primitives.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::evidence::GENESIS_PREV_HASH;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Errors that can occur during hash chain checks.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A record's stored hash doesn't match its recomputed hash.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// The stored hash.
        expected: String,
        /// The recomputed hash.
        actual: String,
    },

    /// A record's `previous_hash` doesn't match its predecessor's hash.
    #[error("chain link broken: expected {expected}, got {actual}")]
    LinkBroken {
        /// The predecessor's recomputed hash.
        expected: String,
        /// The `previous_hash` actually stored.
        actual: String,
    },
}

/// Computes the hex-encoded SHA-256 digest of a byte slice.
#[must_use]
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Hasher for evidence records and their per-control chains.
///
/// The content hash covers the record's canonical byte form; chain linkage
/// is checked separately by comparing each record's stored `previous_hash`
/// against the predecessor's recomputed content hash. The first record in
/// a chain links to [`GENESIS_PREV_HASH`].
pub struct EvidenceHasher;

impl EvidenceHasher {
    /// Hashes a record's canonical byte form.
    #[must_use]
    pub fn hash_record(canonical_bytes: &[u8]) -> String {
        sha256_hex(canonical_bytes)
    }

    /// Verifies that a record's stored hash matches its content.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::HashMismatch`] if the recomputed hash differs.
    pub fn verify_record(canonical_bytes: &[u8], stored_hash: &str) -> Result<(), ChainError> {
        let actual = Self::hash_record(canonical_bytes);
        if actual != stored_hash {
            return Err(ChainError::HashMismatch {
                expected: stored_hash.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Verifies the link between a record and its predecessor.
    ///
    /// For the first record in a chain, `predecessor_hash` must be
    /// [`GENESIS_PREV_HASH`].
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::LinkBroken`] if the stored `previous_hash`
    /// differs from the predecessor's hash.
    pub fn verify_link(stored_prev_hash: &str, predecessor_hash: &str) -> Result<(), ChainError> {
        if stored_prev_hash != predecessor_hash {
            return Err(ChainError::LinkBroken {
                expected: predecessor_hash.to_string(),
                actual: stored_prev_hash.to_string(),
            });
        }
        Ok(())
    }

    /// Whether a `previous_hash` value is the genesis sentinel.
    #[must_use]
    pub fn is_genesis(prev_hash: &str) -> bool {
        prev_hash == GENESIS_PREV_HASH
    }
}
