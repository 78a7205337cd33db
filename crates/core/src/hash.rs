//! Content checksums for cached calibration artifacts.
//!
//! The cache compares checksums to decide whether a second write of the same
//! filename is a harmless repeat or a conflicting artifact.

use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of an artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Digest an in-memory artifact.
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Start a digest fed chunk by chunk, for artifacts read from disk.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha256::new())
    }

    /// Lowercase hex, as written by `sha256sum`.
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        self.0.iter().fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental form of [`ContentHash::compute`].
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}
