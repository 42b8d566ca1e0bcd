//! Checksum calculation for migration files

use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of migration file content
///
/// Computed over the raw bytes so that any edit, including whitespace or line
/// ending changes, is detected the next time the catalog is discovered.
///
/// Returns the lowercase hexadecimal digest (64 characters).
#[must_use]
pub fn calculate_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
