//! Digest adapter for salted block hashing
//!
//! Wraps the supported cryptographic digests behind one fixed call:
//! `salted_digest(salt, block)`. Algorithms are selectable by name, the way
//! the verity table names them. Raw digest sizes map to power-of-two slot
//! sizes so that a whole number of slots always fits a block.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// =============================================================================
// Hash Algorithm
// =============================================================================

/// Supported digest algorithms, each carrying its raw digest size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256, 32-byte digest
    Sha256,
    /// SHA-1, 20-byte digest padded to a 32-byte slot
    Sha1,
}

impl HashAlgorithm {
    /// Resolve an algorithm from its verity table name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha256" => Ok(Self::Sha256),
            "sha1" => Ok(Self::Sha1),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// The verity table name of this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
        }
    }

    /// Raw digest size in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha1 => 20,
        }
    }

    /// Slot size: the smallest power of two that holds a raw digest.
    ///
    /// Digests are stored left-justified and zero-padded to this size so that
    /// slots pack evenly into blocks.
    pub fn slot_size(&self) -> usize {
        self.digest_size().next_power_of_two()
    }

    /// Compute `H(salt || data)`.
    pub fn salted_digest(&self, salt: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(salt);
                hasher.update(data);
                hasher.finalize().to_vec()
            }
            Self::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(salt);
                hasher.update(data);
                hasher.finalize().to_vec()
            }
        }
    }

    /// Compute `H(salt || data)` and write it into `slot`, zero-padding the
    /// tail. `slot` must be exactly `slot_size()` bytes.
    pub fn salted_digest_into(&self, salt: &[u8], data: &[u8], slot: &mut [u8]) {
        debug_assert_eq!(slot.len(), self.slot_size());
        let digest = self.salted_digest(salt, data);
        slot[..digest.len()].copy_from_slice(&digest);
        slot[digest.len()..].fill(0);
    }

    /// Check a computed digest against a stored slot (digest prefix plus
    /// zero padding).
    pub fn slot_matches(&self, slot: &[u8], digest: &[u8]) -> bool {
        let size = self.digest_size();
        slot.len() >= size
            && &slot[..size] == digest
            && slot[size..].iter().all(|&b| b == 0)
    }
}
