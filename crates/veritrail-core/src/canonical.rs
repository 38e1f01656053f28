//! Canonical JSON serialization (RFC 8785 / JCS).
//!
//! Content hashes are computed over a canonical byte representation so that
//! any storage backend can recompute them independently. JCS gives us a
//! deterministic form: sorted object keys, ES6 number formatting, no
//! insignificant whitespace.

use serde::Serialize;
use thiserror::Error;

/// Errors from canonical serialization.
#[derive(Debug, Error)]
pub enum CanonicalError {
    /// The value could not be serialized to canonical JSON.
    #[error("canonical serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serializes a value to its canonical JSON byte representation.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    Ok(serde_jcs::to_vec(value)?)
}

/// Serializes a value to its canonical JSON string representation.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    Ok(serde_jcs::to_string(value)?)
}
