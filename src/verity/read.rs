//! Verified read path with error-corrected fallback
//!
//! Reads try the fast path first: a raw read checked against the verified
//! hash cache. Only blocks that fail the check go through the correction
//! codec, and corrected bytes are re-checked with the same predicate before
//! they are trusted. Large reads fan out across threads through the parallel
//! block processor.

use tracing::debug;

use crate::error::{Error, Result};
use crate::process::{self, ReadOutcome};
use crate::verity::handle::VerityHandle;
use crate::verity::table::VerityTable;
use crate::BLOCK_SIZE;

// =============================================================================
// ECC-Verified Read
// =============================================================================

/// Outcome of a single verified read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifiedRead {
    /// Raw bytes passed the check
    Clean,
    /// Raw bytes failed, the corrected copy passed
    Corrected,
    /// No copy passed the check; `dest` contents are not trustworthy
    Failed,
}

/// Read `dest.len()` bytes at `offset`, verifying with `check`. A failing
/// raw read retries through the correction codec; corrected bytes are never
/// trusted without re-running the same check.
pub(crate) fn read_corrected<F>(
    handle: &VerityHandle,
    dest: &mut [u8],
    offset: u64,
    check: F,
) -> Result<VerifiedRead>
where
    F: Fn(&[u8]) -> bool,
{
    handle.raw_read_at(dest, offset)?;
    if check(dest) {
        return Ok(VerifiedRead::Clean);
    }

    let Some(codec) = handle.codec() else {
        return Ok(VerifiedRead::Failed);
    };

    debug!(offset, "verification failed, attempting corrected read");
    match codec.correct(handle.file(), dest, offset) {
        Ok(()) => {}
        Err(Error::CorrectionFailed { .. }) => return Ok(VerifiedRead::Failed),
        Err(e) => return Err(e),
    }
    if check(dest) {
        Ok(VerifiedRead::Corrected)
    } else {
        Ok(VerifiedRead::Failed)
    }
}

// =============================================================================
// Handle Read Path
// =============================================================================

impl VerityHandle {
    /// Verified positional read.
    ///
    /// With verity active, the range is clipped to the visible data size and
    /// fanned out across threads, each block checked against the hash cache.
    /// Short reads at the end of the data behave like reads at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Some(table) = self.table() else {
            return self.plain_read(buf, offset, self.device_size());
        };
        // Disabled devices, and handles opened without the tree walk, have
        // no verified cache to check against.
        if self.is_disabled() || self.hash_cache.is_empty() {
            return self.plain_read(buf, offset, self.data_size());
        }

        let end = (offset + buf.len() as u64).min(self.data_size());
        if offset >= end {
            return Ok(0);
        }
        let len = (end - offset) as usize;

        let outcome = process::process(&mut buf[..len], offset, BLOCK_SIZE, |slice, sub| {
            self.verified_range(table, slice, sub)
        })?;
        self.add_corrected(outcome.errors_corrected);
        Ok(outcome.bytes_read)
    }

    fn plain_read(&self, buf: &mut [u8], offset: u64, limit: u64) -> Result<usize> {
        let end = (offset + buf.len() as u64).min(limit);
        if offset >= end {
            return Ok(0);
        }
        let len = (end - offset) as usize;
        self.raw_read_at(&mut buf[..len], offset)?;
        Ok(len)
    }

    /// Verify and copy one sub-range; runs on a processor worker thread.
    fn verified_range(
        &self,
        table: &VerityTable,
        slice: &mut [u8],
        offset: u64,
    ) -> Result<ReadOutcome> {
        let block_size = BLOCK_SIZE as usize;
        let slot_size = table.algorithm.slot_size();
        let mut scratch = vec![0u8; block_size];
        let mut corrected = 0u64;
        let mut pos = 0usize;

        while pos < slice.len() {
            let abs = offset + pos as u64;
            let block = abs / BLOCK_SIZE;
            let within = (abs % BLOCK_SIZE) as usize;
            let take = (block_size - within).min(slice.len() - pos);
            let slot = &self.hash_cache[block as usize * slot_size..][..slot_size];

            // All-zero blocks are served without touching the disk.
            if table.algorithm.slot_matches(slot, &self.zero_digest) {
                slice[pos..pos + take].fill(0);
                pos += take;
                continue;
            }

            let whole_block_in_place = within == 0 && take == block_size;
            let dest = if whole_block_in_place {
                &mut slice[pos..pos + block_size]
            } else {
                &mut scratch[..]
            };

            let status = read_corrected(self, dest, block * BLOCK_SIZE, |bytes| {
                table
                    .algorithm
                    .slot_matches(slot, &table.algorithm.salted_digest(&table.salt, bytes))
            })?;
            match status {
                VerifiedRead::Clean => {}
                VerifiedRead::Corrected => corrected += 1,
                VerifiedRead::Failed => {
                    return Err(Error::DataBlockInvalid { block, offset: abs });
                }
            }

            if !whole_block_in_place {
                slice[pos..pos + take].copy_from_slice(&scratch[within..within + take]);
            }
            pos += take;
        }

        Ok(ReadOutcome {
            bytes_read: slice.len(),
            errors_corrected: corrected,
        })
    }
}
