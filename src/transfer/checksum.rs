//! SHA-256 content digests

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of a SHA-256 digest in bytes
pub const CHECKSUM_LEN: usize = 32;

/// Compute the SHA-256 digest of `data`
pub fn compute_checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = StreamingChecksum::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify that `expected` is the digest of `data`
pub fn verify_checksum(data: &[u8], expected: &[u8]) -> bool {
    checksums_match(&compute_checksum(data), expected)
}

/// Byte-for-byte digest comparison.
///
/// Execution time depends only on the slice lengths, not on where the first
/// difference is.
#[must_use]
pub fn checksums_match(actual: &[u8], expected: &[u8]) -> bool {
    if actual.len() != expected.len() {
        return false;
    }
    actual.ct_eq(expected).into()
}

/// Incremental digest for payloads read in buffer-sized pieces
#[derive(Clone, Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> [u8; CHECKSUM_LEN] {
        let digest = self.hasher.finalize();
        let mut out = [0u8; CHECKSUM_LEN];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hex::encode(compute_checksum(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data = b"Hello, World! This payload arrives in pieces.";
        let mut streaming = StreamingChecksum::new();
        for piece in data.chunks(7) {
            streaming.update(piece);
        }
        assert_eq!(streaming.finalize(), compute_checksum(data));
    }

    #[test]
    fn test_verify_checksum() {
        let data = b"test data";
        let checksum = compute_checksum(data);
        assert!(verify_checksum(data, &checksum));
        assert!(!verify_checksum(b"test datA", &checksum));
        assert!(!verify_checksum(data, &checksum[..31]));
        assert!(!verify_checksum(data, b""));
    }
}
