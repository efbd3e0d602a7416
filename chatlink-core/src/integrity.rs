//! Integrity: SHA-256 digest of received files, logged so transfers can be compared end to end.

use sha2::{Digest, Sha256};

/// Hash a payload. Returns 32-byte digest.
pub fn hash_payload(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of a payload.
pub fn digest_hex(payload: &[u8]) -> String {
    hash_payload(payload)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
