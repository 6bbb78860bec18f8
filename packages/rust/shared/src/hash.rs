//! Content hashing used for cache keys and artifact checksums.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, ShowrunnerError};

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Stable fingerprint of a serializable value, namespaced by `kind`.
///
/// Values are hashed through their canonical JSON encoding, so callers must
/// only fingerprint types with a deterministic field order (structs, vecs;
/// never hash maps).
pub fn fingerprint<T: Serialize + ?Sized>(kind: &str, value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|e| ShowrunnerError::validation(format!("cannot fingerprint {kind}: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}
