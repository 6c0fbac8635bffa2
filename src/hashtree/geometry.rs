//! Hash tree geometry
//!
//! The level-count and per-level block-count arithmetic, shared by the
//! builder and the on-disk verifier so the two can never disagree about the
//! shape of a tree.

/// Shape of a hash tree for a given amount of data.
///
/// `level_blocks[0]` is the base level (direct digests of data blocks) and
/// the last entry is the top level, which is always a single block for
/// non-empty data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeGeometry {
    block_size: u64,
    /// Digest slots per tree block
    hashes_per_block: u64,
    /// Blocks per level, base level first
    level_blocks: Vec<u64>,
}

impl TreeGeometry {
    /// Compute the tree shape for `data_size` bytes of input.
    ///
    /// `slot_size` is the padded digest slot size; it is always a power of
    /// two smaller than half the block size, so it divides the block size
    /// evenly.
    pub fn new(data_size: u64, block_size: u64, slot_size: u64) -> Self {
        debug_assert!(slot_size.is_power_of_two());
        debug_assert!(slot_size * 2 < block_size);

        let hashes_per_block = block_size / slot_size;
        let mut level_blocks = Vec::new();
        let mut blocks = data_size.div_ceil(block_size);

        loop {
            blocks = blocks.div_ceil(hashes_per_block);
            level_blocks.push(blocks);
            if blocks <= 1 {
                break;
            }
        }

        Self {
            block_size,
            hashes_per_block,
            level_blocks,
        }
    }

    /// Digest slots per tree block.
    pub fn hashes_per_block(&self) -> u64 {
        self.hashes_per_block
    }

    /// Number of levels in the tree.
    pub fn num_levels(&self) -> usize {
        self.level_blocks.len()
    }

    /// Blocks in a level; level 0 is the base.
    pub fn blocks_at(&self, level: usize) -> u64 {
        self.level_blocks[level]
    }

    /// Byte size of a level; level 0 is the base.
    pub fn level_size(&self, level: usize) -> u64 {
        self.level_blocks[level] * self.block_size
    }

    /// Total on-disk size of the tree in bytes.
    pub fn tree_size(&self) -> u64 {
        self.level_blocks.iter().sum::<u64>() * self.block_size
    }

    /// Byte offset of a level relative to the start of the on-disk tree.
    ///
    /// Levels are written top level first, base level last.
    pub fn level_offset(&self, level: usize) -> u64 {
        self.level_blocks[level + 1..].iter().sum::<u64>() * self.block_size
    }
}
