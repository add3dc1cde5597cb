//! Incremental content hashing with in-order delivery. Chunks may land
//! out of order; bytes enter the digest exactly once, in strictly
//! increasing offset order.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::FetchError;

/// Running SHA-256 over the object, fed through an in-order cursor.
pub struct IntegrityVerifier {
    hasher: Sha256,
    cursor: u64,
    /// Landed ranges waiting for the cursor to reach them.
    pending: BTreeMap<u64, Vec<u8>>,
    buffered_bytes: u64,
}

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            cursor: 0,
            pending: BTreeMap::new(),
            buffered_bytes: 0,
        }
    }

    /// Start the cursor past an already-verified prefix (resume).
    pub fn with_cursor(offset: u64) -> Self {
        let mut v = Self::new();
        v.cursor = offset;
        v
    }

    /// Accept a landed range. If it begins at the cursor it is hashed
    /// immediately and any now-contiguous buffered ranges are drained;
    /// otherwise it is buffered.
    pub fn accept(&mut self, offset: u64, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if offset == self.cursor {
            self.cursor += bytes.len() as u64;
            self.hasher.update(&bytes);
            self.drain();
        } else {
            self.buffered_bytes += bytes.len() as u64;
            self.pending.insert(offset, bytes);
        }
    }

    fn drain(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.cursor {
                break;
            }
            let bytes = entry.remove();
            self.buffered_bytes -= bytes.len() as u64;
            self.cursor += bytes.len() as u64;
            self.hasher.update(&bytes);
        }
    }

    /// Next offset the digest is waiting for.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// True when nothing is buffered ahead of the cursor.
    pub fn is_contiguous(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// Consume the verifier and return the lowercase hex digest.
    pub fn finish(self) -> String {
        debug_assert!(self.pending.is_empty(), "digest finished with gaps");
        hex::encode(self.hasher.finalize())
    }
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare a computed digest against the expected one, case-insensitive.
pub fn check_digest(actual: &str, expected: &str) -> Result<(), FetchError> {
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(FetchError::IntegrityMismatch {
            expected: expected.trim().to_ascii_lowercase(),
            actual: actual.to_string(),
        })
    }
}

/// One-shot SHA-256 hex digest.
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SHA-256 of the empty string.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_empty_object() {
        let v = IntegrityVerifier::new();
        assert_eq!(v.finish(), EMPTY_SHA256);
    }

    #[test]
    fn test_in_order_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut v = IntegrityVerifier::new();
        v.accept(0, data[..10].to_vec());
        v.accept(10, data[10..].to_vec());
        assert_eq!(v.finish(), sha256_hex(&data));
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let mut v = IntegrityVerifier::new();
        v.accept(1024, data[1024..2048].to_vec());
        v.accept(3072, data[3072..].to_vec());
        assert_eq!(v.cursor(), 0);
        assert!(!v.is_contiguous());
        v.accept(0, data[..1024].to_vec());
        // 0..2048 drained, 3072.. still buffered
        assert_eq!(v.cursor(), 2048);
        v.accept(2048, data[2048..3072].to_vec());
        assert_eq!(v.cursor(), 4096);
        assert!(v.is_contiguous());
        assert_eq!(v.finish(), sha256_hex(&data));
    }

    #[test]
    fn test_buffered_bytes_accounting() {
        let mut v = IntegrityVerifier::new();
        v.accept(100, vec![1; 50]);
        assert_eq!(v.buffered_bytes(), 50);
        v.accept(0, vec![0; 100]);
        assert_eq!(v.buffered_bytes(), 0);
    }

    #[test]
    fn test_check_digest_case_insensitive() {
        let digest = sha256_hex(b"abc");
        assert!(check_digest(&digest, &digest.to_ascii_uppercase()).is_ok());
        let err = check_digest(&digest, EMPTY_SHA256).unwrap_err();
        assert!(matches!(err, FetchError::IntegrityMismatch { .. }));
    }

    #[test]
    fn test_resume_cursor_skips_prefix() {
        let mut v = IntegrityVerifier::with_cursor(512);
        v.accept(512, vec![7; 100]);
        assert_eq!(v.cursor(), 612);
    }
}
