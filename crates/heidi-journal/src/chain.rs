//! Hash-chain primitives shared by the writer and the replay verifier.
//!
//! Each journal line carries the SHA-256 of the previous line's bytes
//! (newline included); the first line chains to the SHA-256 of the run id.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Chain seed for a run: SHA-256 over the run id itself.
pub fn seed_hash(run_id: &str) -> String {
    sha256_hex(run_id.as_bytes())
}

/// Hash of one framed journal line. `line` must be the exact bytes on
/// disk, including the trailing newline.
pub fn line_hash(line: &[u8]) -> String {
    sha256_hex(line)
}

/// Whether a string is a well-formed chain hash (64 lowercase hex chars).
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
