//! Interleaved Reed-Solomon correction adapter
//!
//! Implements [`CorrectionCodec`] on top of the `reed-solomon-erasure` crate
//! using the dm-verity interleaving access pattern: the protected blocks form
//! a grid of `rs_k` rows by `rounds` block-columns, and a codeword is one
//! byte-column of that grid. Block `b` sits at row `b / rounds`, column
//! `b % rounds`, so the 4096 codewords touching one block all involve the
//! same set of `rs_k` blocks plus `roots` parity chunks — which lets a whole
//! block be reconstructed with a single shard-set reconstruction.
//!
//! Blocks past the end of the grid are implicit zero. Requested blocks are
//! treated as erasures: the caller already knows they failed verification,
//! and the codec reconstructs them from the surviving rows and parity. More
//! than `roots` damaged blocks per column is beyond the code's correction
//! capacity and fails.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::unix::fs::FileExt;

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, instrument};

use super::{CorrectionCodec, EccInfo};
use crate::error::{Error, Result};

// =============================================================================
// Interleaved RS Codec
// =============================================================================

/// Production correction codec over an interleaved Reed-Solomon parity
/// region.
pub struct InterleavedRsCodec {
    info: EccInfo,
    rs: ReedSolomon,
}

impl InterleavedRsCodec {
    pub fn new(info: EccInfo) -> Result<Self> {
        let rs = ReedSolomon::new(info.rs_k(), info.roots as usize).map_err(|e| {
            Error::InvalidEccConfig(format!("failed to create Reed-Solomon codec: {e}"))
        })?;
        Ok(Self { info, rs })
    }

    pub fn info(&self) -> &EccInfo {
        &self.info
    }

    /// Generate the parity region for the protected blocks and write it at
    /// `info.start`. Used when assembling a protected image.
    #[instrument(skip(self, file))]
    pub fn generate(&self, file: &File) -> Result<()> {
        let bs = self.info.block_size as usize;
        for column in 0..self.info.rounds {
            let mut shards: Vec<Vec<u8>> = Vec::with_capacity(255);
            for row in 0..self.info.rs_k() as u64 {
                shards.push(self.read_grid_block(file, row * self.info.rounds + column)?);
            }
            for _ in 0..self.info.roots {
                shards.push(vec![0u8; bs]);
            }

            self.rs.encode(&mut shards).map_err(|e| Error::CorrectionFailed {
                offset: self.info.start,
                reason: format!("parity encoding failed: {e}"),
            })?;

            for (t, parity) in shards[self.info.rs_k()..].iter().enumerate() {
                file.write_all_at(parity, self.parity_offset(t as u64, column))?;
            }
        }

        debug!(
            blocks = self.info.blocks,
            parity_bytes = self.info.parity_size(),
            "parity region generated"
        );
        Ok(())
    }

    /// Reconstruct one column's worth of erased blocks. `erased` maps rows to
    /// their block indices; all other rows are read raw and trusted.
    fn reconstruct_column(
        &self,
        file: &File,
        column: u64,
        erased: &HashSet<u64>,
        offset: u64,
    ) -> Result<HashMap<u64, Vec<u8>>> {
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(255);
        for row in 0..self.info.rs_k() as u64 {
            let block = row * self.info.rounds + column;
            if erased.contains(&block) {
                shards.push(None);
            } else {
                shards.push(Some(self.read_grid_block(file, block)?));
            }
        }
        for t in 0..self.info.roots as u64 {
            let mut parity = vec![0u8; self.info.block_size as usize];
            file.read_exact_at(&mut parity, self.parity_offset(t, column))?;
            shards.push(Some(parity));
        }

        self.rs
            .reconstruct_data(&mut shards)
            .map_err(|e| Error::CorrectionFailed {
                offset,
                reason: format!("Reed-Solomon reconstruction failed: {e}"),
            })?;

        let mut recovered = HashMap::new();
        for row in 0..self.info.rs_k() as u64 {
            let block = row * self.info.rounds + column;
            if erased.contains(&block) {
                let shard = shards[row as usize].take().ok_or_else(|| {
                    Error::CorrectionFailed {
                        offset,
                        reason: "reconstruction returned no shard".to_string(),
                    }
                })?;
                recovered.insert(block, shard);
            }
        }
        Ok(recovered)
    }

    /// Raw grid block: device block below `blocks`, implicit zeros past it.
    fn read_grid_block(&self, file: &File, block: u64) -> Result<Vec<u8>> {
        let bs = self.info.block_size as usize;
        let mut buf = vec![0u8; bs];
        if block < self.info.blocks {
            file.read_exact_at(&mut buf, block * self.info.block_size)?;
        }
        Ok(buf)
    }

    fn parity_offset(&self, root: u64, column: u64) -> u64 {
        self.info.start
            + root * self.info.rounds * self.info.block_size
            + column * self.info.block_size
    }
}

impl CorrectionCodec for InterleavedRsCodec {
    fn correct(&self, file: &File, dest: &mut [u8], offset: u64) -> Result<()> {
        if dest.is_empty() {
            return Ok(());
        }

        let bs = self.info.block_size;
        let first = offset / bs;
        let last = (offset + dest.len() as u64 - 1) / bs;
        if last >= self.info.blocks {
            return Err(Error::CorrectionFailed {
                offset,
                reason: "range outside the protected region".to_string(),
            });
        }

        let erased: HashSet<u64> = (first..=last).collect();
        let columns: HashSet<u64> = erased.iter().map(|b| b % self.info.rounds).collect();

        let mut recovered: HashMap<u64, Vec<u8>> = HashMap::new();
        for column in columns {
            recovered.extend(self.reconstruct_column(file, column, &erased, offset)?);
        }

        for block in first..=last {
            let data = &recovered[&block];
            let block_start = block * bs;
            let from = offset.max(block_start);
            let to = (offset + dest.len() as u64).min(block_start + bs);
            let dest_range = (from - offset) as usize..(to - offset) as usize;
            let src_range = (from - block_start) as usize..(to - block_start) as usize;
            dest[dest_range].copy_from_slice(&data[src_range]);
        }

        debug!(offset, len = dest.len(), blocks = last - first + 1, "corrected read");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
