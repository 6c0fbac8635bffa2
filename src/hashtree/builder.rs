//! Streaming Merkle hash tree builder
//!
//! Streams image data in arbitrary chunkings, hashes it block by block into
//! the base level, then folds levels upward until a single top block remains.
//! The resulting tree is written top level first, base level last, which is
//! the order the on-disk verifier expects.
//!
//! Zero runs can be appended without materializing them: every whole zero
//! block reuses one cached digest, so sparse images hash at memory speed and
//! produce byte-identical trees to their non-sparse equivalents.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

use crate::digest::HashAlgorithm;
use crate::error::{Error, Result};
use crate::hashtree::geometry::TreeGeometry;

// =============================================================================
// Hash Tree Builder
// =============================================================================

/// Builds a salted, block-aligned Merkle tree over streamed image data.
#[derive(Debug)]
pub struct HashTreeBuilder {
    block_size: usize,
    algorithm: HashAlgorithm,
    salt: Vec<u8>,
    /// Total bytes the stream must deliver, fixed at `initialize`
    expected_size: u64,
    /// Bytes consumed so far across all `update` calls
    streamed: u64,
    /// Sub-block remainder carried between `update` calls
    leftover: Vec<u8>,
    /// Cached digest slot of an all-zero block
    zero_block_hash: Vec<u8>,
    /// Tree levels; index 0 is the base, the last entry the top
    levels: Vec<Vec<u8>>,
    root_hash: Vec<u8>,
    initialized: bool,
}

impl HashTreeBuilder {
    /// Create a builder for the given block size and digest algorithm.
    ///
    /// The padded digest slot must pack into a block with room to spare
    /// (`slot_size * 2 < block_size`), otherwise the tree cannot shrink
    /// between levels.
    pub fn new(block_size: u64, algorithm: HashAlgorithm) -> Result<Self> {
        let slot = algorithm.slot_size() as u64;
        if !block_size.is_power_of_two() || slot * 2 >= block_size {
            return Err(Error::UnsupportedBlockSize(block_size));
        }

        Ok(Self {
            block_size: block_size as usize,
            algorithm,
            salt: Vec::new(),
            expected_size: 0,
            streamed: 0,
            leftover: Vec::new(),
            zero_block_hash: Vec::new(),
            levels: Vec::new(),
            root_hash: Vec::new(),
            initialized: false,
        })
    }

    /// Total on-disk tree size for `input_size` bytes of data.
    ///
    /// Pure function of the size and the builder parameters; no data or salt
    /// required.
    pub fn tree_size(&self, input_size: u64) -> u64 {
        self.geometry(input_size).tree_size()
    }

    /// Prepare for streaming `expected_size` bytes hashed with `salt`.
    ///
    /// Fails unless `expected_size` is block-aligned. Computes and caches the
    /// zero-block digest up front so sparse updates never hash zero blocks.
    pub fn initialize(&mut self, expected_size: u64, salt: &[u8]) -> Result<()> {
        if expected_size % self.block_size as u64 != 0 {
            return Err(Error::NotBlockAligned {
                size: expected_size,
                block_size: self.block_size as u64,
            });
        }

        self.salt = salt.to_vec();
        self.expected_size = expected_size;
        self.streamed = 0;
        self.leftover = Vec::with_capacity(self.block_size);
        self.root_hash.clear();

        let mut slot = vec![0u8; self.algorithm.slot_size()];
        let zero_block = vec![0u8; self.block_size];
        self.algorithm
            .salted_digest_into(&self.salt, &zero_block, &mut slot);
        self.zero_block_hash = slot;

        let base_size = self.geometry(expected_size).level_size(0) as usize;
        self.levels = vec![Vec::with_capacity(base_size)];
        self.initialized = true;

        debug!(
            expected_size,
            algorithm = self.algorithm.name(),
            "hash tree builder initialized"
        );
        Ok(())
    }

    /// Stream a chunk of image data. Chunks may be any size, including
    /// sub-block; partial blocks are carried over to the next call.
    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        self.account(data.len() as u64)?;

        if !self.leftover.is_empty() {
            let fill = (self.block_size - self.leftover.len()).min(data.len());
            self.leftover.extend_from_slice(&data[..fill]);
            data = &data[fill..];
            if self.leftover.len() == self.block_size {
                Self::push_digest(self.algorithm, &self.salt, &mut self.levels[0], &self.leftover);
                self.leftover.clear();
            }
        }

        let chunks = data.chunks_exact(self.block_size);
        let remainder = chunks.remainder();
        for block in chunks {
            Self::push_digest(self.algorithm, &self.salt, &mut self.levels[0], block);
        }
        self.leftover.extend_from_slice(remainder);
        Ok(())
    }

    /// Stream `len` zero bytes without materializing them.
    ///
    /// Whole zero blocks append the cached zero-block digest; portions that
    /// straddle a partial block go through the leftover buffer so the result
    /// is byte-identical to `update` with an actual zero buffer.
    pub fn update_zeros(&mut self, len: u64) -> Result<()> {
        self.account(len)?;
        let mut remaining = len;

        if !self.leftover.is_empty() {
            let fill = ((self.block_size - self.leftover.len()) as u64).min(remaining);
            self.leftover
                .resize(self.leftover.len() + fill as usize, 0);
            remaining -= fill;
            if self.leftover.len() == self.block_size {
                Self::push_digest(self.algorithm, &self.salt, &mut self.levels[0], &self.leftover);
                self.leftover.clear();
            }
        }

        let whole_blocks = remaining / self.block_size as u64;
        let base = &mut self.levels[0];
        for _ in 0..whole_blocks {
            base.extend_from_slice(&self.zero_block_hash);
        }

        // The leftover buffer is empty whenever a tail remains here: the
        // fill branch either drained `remaining` or completed a full block.
        let tail = (remaining % self.block_size as u64) as usize;
        if tail > 0 {
            self.leftover.resize(tail, 0);
        }
        Ok(())
    }

    /// Fold the streamed base level into upper levels and compute the root.
    ///
    /// Fails without touching the root hash if the stream did not deliver
    /// exactly the expected byte count.
    pub fn build(&mut self) -> Result<()> {
        if !self.initialized || self.streamed != self.expected_size || !self.leftover.is_empty() {
            return Err(Error::StreamSizeMismatch {
                streamed: self.streamed,
                expected: self.expected_size,
            });
        }

        let geometry = self.geometry(self.expected_size);
        let base_size = geometry.level_size(0) as usize;
        let padded = round_up(self.levels[0].len(), self.block_size);
        self.levels[0].resize(padded, 0);
        if self.levels[0].len() != base_size {
            return Err(Error::TreeSizeMismatch {
                expected: base_size,
                actual: self.levels[0].len(),
            });
        }

        while self.levels.last().map_or(0, Vec::len) > self.block_size {
            let next = {
                let current = &self.levels[self.levels.len() - 1];
                let mut next =
                    Vec::with_capacity(round_up(
                        (current.len() / self.block_size) * self.algorithm.slot_size(),
                        self.block_size,
                    ));
                let mut slot = vec![0u8; self.algorithm.slot_size()];
                for block in current.chunks(self.block_size) {
                    self.algorithm.salted_digest_into(&self.salt, block, &mut slot);
                    next.extend_from_slice(&slot);
                }
                let padded = round_up(next.len(), self.block_size);
                next.resize(padded, 0);
                next
            };
            self.levels.push(next);
        }

        let top = &self.levels[self.levels.len() - 1];
        self.root_hash = self.algorithm.salted_digest(&self.salt, top);

        debug!(
            levels = self.levels.len(),
            root = %hex::encode(&self.root_hash),
            "hash tree built"
        );
        Ok(())
    }

    /// Compare the built tree against a serialized copy, top level first.
    ///
    /// The error names the first level and byte offset that differ.
    pub fn check(&self, tree: &[u8]) -> Result<()> {
        let expected: usize = self.levels.iter().map(Vec::len).sum();
        if tree.len() != expected {
            return Err(Error::TreeSizeMismatch {
                expected,
                actual: tree.len(),
            });
        }

        let mut pos = 0;
        for (level, data) in self.levels.iter().enumerate().rev() {
            let theirs = &tree[pos..pos + data.len()];
            if theirs != data.as_slice() {
                let offset = data
                    .iter()
                    .zip(theirs)
                    .position(|(a, b)| a != b)
                    .unwrap_or(0);
                return Err(Error::TreeMismatch { level, offset });
            }
            pos += data.len();
        }
        Ok(())
    }

    /// Write the tree to `file` starting at `offset`, top level first.
    pub fn write_to_fd(&self, file: &File, offset: u64) -> Result<()> {
        let mut pos = offset;
        for level in self.levels.iter().rev() {
            file.write_all_at(level, pos)?;
            pos += level.len() as u64;
        }
        Ok(())
    }

    /// Write the tree to a fresh file at `path`.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        self.write_to_fd(&file, 0)
    }

    /// Root digest; empty until `build` succeeds.
    pub fn root_hash(&self) -> &[u8] {
        &self.root_hash
    }

    /// Root digest as lowercase hex.
    pub fn root_hash_hex(&self) -> String {
        hex::encode(&self.root_hash)
    }

    /// Built levels, base level first. Empty until `initialize`.
    pub fn levels(&self) -> &[Vec<u8>] {
        &self.levels
    }

    fn geometry(&self, input_size: u64) -> TreeGeometry {
        TreeGeometry::new(
            input_size,
            self.block_size as u64,
            self.algorithm.slot_size() as u64,
        )
    }

    fn account(&mut self, len: u64) -> Result<()> {
        debug_assert!(self.initialized);
        let streamed = self.streamed + len;
        if streamed > self.expected_size {
            return Err(Error::StreamSizeMismatch {
                streamed,
                expected: self.expected_size,
            });
        }
        self.streamed = streamed;
        Ok(())
    }

    fn push_digest(algorithm: HashAlgorithm, salt: &[u8], level: &mut Vec<u8>, block: &[u8]) {
        let digest = algorithm.salted_digest(salt, block);
        let pad = algorithm.slot_size() - digest.len();
        level.extend_from_slice(&digest);
        level.extend(std::iter::repeat(0).take(pad));
    }
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    const BLOCK: u64 = 4096;
    /// Salt used by the image build tooling this format comes from.
    const SALT_HEX: &str = "aee087a5be3b982978c923f566a94613496b417f2af592639bc80d141e34dfe7";

    fn salt() -> Vec<u8> {
        hex::decode(SALT_HEX).unwrap()
    }

    fn builder() -> HashTreeBuilder {
        HashTreeBuilder::new(BLOCK, HashAlgorithm::Sha256).unwrap()
    }

    fn build_root(data: &[u8]) -> String {
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(data).unwrap();
        b.build().unwrap();
        b.root_hash_hex()
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    #[test]
    fn test_initialize_rejects_unaligned_size() {
        let mut b = builder();
        assert_matches!(
            b.initialize(4095, &salt()),
            Err(Error::NotBlockAligned { .. })
        );
        assert!(b.initialize(4096, &salt()).is_ok());
    }

    #[test]
    fn test_rejects_tiny_block_size() {
        assert_matches!(
            HashTreeBuilder::new(64, HashAlgorithm::Sha256),
            Err(Error::UnsupportedBlockSize(64))
        );
    }

    #[test]
    fn test_zero_block_hash() {
        let mut b = builder();
        b.initialize(4096, &salt()).unwrap();
        assert_eq!(
            hex::encode(&b.zero_block_hash),
            "6eb8c4e1bce842d137f18b27beb857d3b43899d178090537ad7a0fbe3bf4126a"
        );
    }

    // =========================================================================
    // Tree construction
    // =========================================================================

    #[test]
    fn test_hash_single_block() {
        let data = vec![1u8; 4096];
        assert_eq!(
            build_root(&data),
            "e69eb527b16f933483768e92de9bca45f6cc09208525d408436bb362eb865d32"
        );
    }

    #[test]
    fn test_hash_single_level() {
        let data = vec![0u8; 128 * 4096];
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data).unwrap();
        b.build().unwrap();
        assert_eq!(b.levels().len(), 1);
        assert_eq!(
            b.root_hash_hex(),
            "62a4fbe8c9036168ba77fe3e3fd78dd6ed963aeb8aaaa36e84f5c7f9107c6b78"
        );
    }

    #[test]
    fn test_hash_multiple_levels() {
        let data = vec![0xffu8; 129 * 4096];
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data).unwrap();
        b.build().unwrap();
        assert_eq!(b.levels().len(), 2);
        assert_eq!(b.levels()[0].len(), 2 * 4096);
        assert_eq!(b.levels()[1].len(), 4096);
        assert_eq!(
            b.root_hash_hex(),
            "9e74f2d47a990c276093760f01de5e9039883e808286ee9492c9cafe9e4ff825"
        );
    }

    #[test]
    fn test_tree_size_matches_built_levels() {
        let data = vec![0x5au8; 300 * 4096];
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data).unwrap();
        b.build().unwrap();
        let total: usize = b.levels().iter().map(Vec::len).sum();
        assert_eq!(total as u64, b.tree_size(data.len() as u64));
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    #[test]
    fn test_streaming_chunking_invariance() {
        let data: Vec<u8> = (0..256 * 4096).map(|i| (i % 256) as u8).collect();
        let expected = build_root(&data);

        // Deterministic ragged chunk sizes, several below a block.
        let sizes = [1usize, 4095, 4096, 5000, 17, 8192, 123, 40960];
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        let mut rest = &data[..];
        let mut i = 0;
        while !rest.is_empty() {
            let take = sizes[i % sizes.len()].min(rest.len());
            b.update(&rest[..take]).unwrap();
            rest = &rest[take..];
            i += 1;
        }
        b.build().unwrap();
        assert_eq!(b.root_hash_hex(), expected);
    }

    #[test]
    fn test_sparse_updates_match_materialized_zeros() {
        let mut dense = builder();
        dense.initialize(8 * 4096, &salt()).unwrap();
        dense.update(&vec![0u8; 8 * 4096]).unwrap();
        dense.build().unwrap();

        let mut sparse = builder();
        sparse.initialize(8 * 4096, &salt()).unwrap();
        sparse.update_zeros(8 * 4096).unwrap();
        sparse.build().unwrap();

        assert_eq!(dense.root_hash(), sparse.root_hash());
        assert_eq!(dense.levels(), sparse.levels());
    }

    #[test]
    fn test_sparse_hole_straddling_blocks() {
        let mut data = vec![0u8; 4 * 4096];
        data[..100].copy_from_slice(&[7u8; 100]);
        let expected = build_root(&data);

        // 100 data bytes, then a hole covering the rest.
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data[..100]).unwrap();
        b.update_zeros(data.len() as u64 - 100).unwrap();
        b.build().unwrap();
        assert_eq!(b.root_hash_hex(), expected);
    }

    #[test]
    fn test_sparse_run_shorter_than_leftover_gap() {
        // A zero run that neither completes the pending block nor starts a
        // new one must leave the leftover buffer intact.
        let mut data = vec![9u8; 2 * 4096];
        data[100..150].fill(0);
        let expected = build_root(&data);

        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data[..100]).unwrap();
        b.update_zeros(50).unwrap();
        b.update(&data[150..]).unwrap();
        b.build().unwrap();
        assert_eq!(b.root_hash_hex(), expected);
    }

    #[test]
    fn test_build_fails_on_short_stream() {
        let mut b = builder();
        b.initialize(2 * 4096, &salt()).unwrap();
        b.update(&vec![3u8; 4096]).unwrap();
        assert_matches!(b.build(), Err(Error::StreamSizeMismatch { .. }));
        assert!(b.root_hash().is_empty());
    }

    #[test]
    fn test_update_fails_past_expected_size() {
        let mut b = builder();
        b.initialize(4096, &salt()).unwrap();
        assert_matches!(
            b.update(&vec![0u8; 4097]),
            Err(Error::StreamSizeMismatch { .. })
        );
    }

    proptest! {
        #[test]
        fn prop_root_independent_of_chunking(
            mut cuts in proptest::collection::vec(0usize..16 * 4096, 0..8)
        ) {
            let data: Vec<u8> = (0..16 * 4096).map(|i| (i * 31 % 251) as u8).collect();
            let expected = build_root(&data);

            cuts.sort_unstable();
            let mut b = builder();
            b.initialize(data.len() as u64, &salt()).unwrap();
            let mut prev = 0;
            for cut in cuts {
                b.update(&data[prev..cut]).unwrap();
                prev = cut;
            }
            b.update(&data[prev..]).unwrap();
            b.build().unwrap();
            prop_assert_eq!(b.root_hash_hex(), expected);
        }
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    #[test]
    fn test_check_roundtrip() {
        let data = vec![0xabu8; 129 * 4096];
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data).unwrap();
        b.build().unwrap();

        let mut serialized = Vec::new();
        for level in b.levels().iter().rev() {
            serialized.extend_from_slice(level);
        }
        assert!(b.check(&serialized).is_ok());

        // Flip one byte in the base level (stored last on disk).
        let top_len = b.levels()[1].len();
        serialized[top_len + 5] ^= 0xff;
        assert_matches!(
            b.check(&serialized),
            Err(Error::TreeMismatch { level: 0, offset: 5 })
        );

        serialized.pop();
        assert_matches!(b.check(&serialized), Err(Error::TreeSizeMismatch { .. }));
    }

    #[test]
    fn test_write_to_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.img");

        let data = vec![0x11u8; 200 * 4096];
        let mut b = builder();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data).unwrap();
        b.build().unwrap();
        b.write_to_file(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, b.tree_size(data.len() as u64));
        assert!(b.check(&bytes).is_ok());
    }

    // =========================================================================
    // Algorithm selection
    // =========================================================================

    #[test]
    fn test_sha1_pads_digest_slots() {
        let data = vec![0x42u8; 4096];
        let sha256_root = build_root(&data);

        let mut b = HashTreeBuilder::new(BLOCK, HashAlgorithm::Sha1).unwrap();
        b.initialize(data.len() as u64, &salt()).unwrap();
        b.update(&data).unwrap();
        b.build().unwrap();

        assert_ne!(b.root_hash_hex(), sha256_root);
        // Every 32-byte slot carries a 20-byte digest and 12 zero bytes.
        for slot in b.levels()[0].chunks(32) {
            assert!(slot[20..].iter().all(|&x| x == 0));
        }
    }
}
