//! Parallel block processor
//!
//! Splits a byte range into block-aligned sub-ranges and runs a caller read
//! function on each in its own thread, joining all of them before returning.
//! Threads are spawned per call and write into disjoint slices of the
//! caller's buffer, so workers never need to synchronize with each other.
//!
//! There is no partial success: one failing sub-range fails the whole call,
//! but every spawned thread is still joined first.

use tracing::{debug, warn};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Lower bound on worker threads per call
pub const MIN_THREADS: usize = 1;

/// Upper bound on worker threads per call
pub const MAX_THREADS: usize = 64;

// =============================================================================
// Read Outcome
// =============================================================================

/// Result of one read, either for a single sub-range or aggregated across
/// all partitions of a `process` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes read into the destination slice
    pub bytes_read: usize,
    /// Blocks recovered through error correction
    pub errors_corrected: u64,
}

// =============================================================================
// Process
// =============================================================================

/// Run `read_func` over `buf` in parallel, one thread per block-aligned
/// partition of `[offset, offset + buf.len())`.
///
/// Thread count is the online CPU count clamped to `[1, 64]`, shrunk further
/// so no thread is left without a partition. Returns the summed bytes and
/// corrected-error counts of all partitions.
pub fn process<F>(buf: &mut [u8], offset: u64, block_size: u64, read_func: F) -> Result<ReadOutcome>
where
    F: Fn(&mut [u8], u64) -> Result<ReadOutcome> + Sync,
{
    let count = buf.len() as u64;
    if count == 0 {
        return Ok(ReadOutcome::default());
    }

    let max_threads = num_cpus::get().clamp(MIN_THREADS, MAX_THREADS);
    let start = offset - offset % block_size;
    let blocks = count.div_ceil(block_size);
    let chunk = blocks.div_ceil(max_threads as u64) * block_size;

    // Partition boundaries stay on the block grid anchored at `start`; the
    // final partition is clipped to the remaining byte count.
    let end = offset + count;
    let mut parts: Vec<(u64, u64)> = Vec::with_capacity(max_threads);
    let mut pos = offset;
    let mut boundary = start + chunk;
    while pos < end {
        let stop = if parts.len() + 1 == max_threads {
            end
        } else {
            boundary.min(end)
        };
        parts.push((pos, stop));
        pos = stop;
        boundary += chunk;
    }

    debug!(
        count,
        offset,
        threads = parts.len(),
        "processing range across threads"
    );

    // Carve the buffer into one disjoint slice per partition.
    let mut slices: Vec<(&mut [u8], u64)> = Vec::with_capacity(parts.len());
    let mut rest = buf;
    for &(part_offset, part_end) in &parts {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut((part_end - part_offset) as usize);
        slices.push((head, part_offset));
        rest = tail;
    }

    let read_func = &read_func;
    let joined = crossbeam::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(slices.len());
        let mut failure: Option<Error> = None;

        for (index, (slice, part_offset)) in slices.into_iter().enumerate() {
            let spawned = scope
                .builder()
                .name(format!("veritree-read-{index}"))
                .spawn(move |_| read_func(slice, part_offset));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(index, error = %e, "failed to spawn read thread");
                    failure = Some(Error::ThreadSpawn(e.to_string()));
                    break;
                }
            }
        }

        // Join everything that was spawned, even after a failure.
        let mut outcome = ReadOutcome::default();
        for handle in handles {
            match handle.join() {
                Ok(Ok(partial)) => {
                    outcome.bytes_read += partial.bytes_read;
                    outcome.errors_corrected += partial.errors_corrected;
                }
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(_) => {
                    if failure.is_none() {
                        failure = Some(Error::ThreadJoin);
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    });

    joined.map_err(|_| Error::ThreadJoin)?
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BLOCK: u64 = 4096;

    #[test]
    fn test_empty_range_spawns_nothing() {
        let calls = AtomicUsize::new(0);
        let mut buf = [];
        let outcome = process(&mut buf, 0, BLOCK, |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReadOutcome::default())
        })
        .unwrap();
        assert_eq!(outcome, ReadOutcome::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_partitions_cover_range_exactly() {
        let mut buf = vec![0u8; 37 * 4096 + 123];
        let ranges = Mutex::new(Vec::new());

        let outcome = process(&mut buf, 8192, BLOCK, |slice, offset| {
            ranges.lock().push((offset, slice.len()));
            slice.fill(0xaa);
            Ok(ReadOutcome {
                bytes_read: slice.len(),
                errors_corrected: 1,
            })
        })
        .unwrap();

        let mut ranges = ranges.into_inner();
        ranges.sort_unstable();

        assert_eq!(outcome.bytes_read, 37 * 4096 + 123);
        assert_eq!(outcome.errors_corrected, ranges.len() as u64);
        assert!(ranges.len() <= MAX_THREADS);

        // Contiguous, non-overlapping, block-aligned boundaries.
        let mut pos = 8192u64;
        for &(offset, len) in &ranges {
            assert_eq!(offset, pos);
            assert_eq!(offset % BLOCK, 0);
            pos += len as u64;
        }
        assert_eq!(pos, 8192 + buf.len() as u64);

        // Every byte of the buffer was written by exactly one worker.
        assert!(buf.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_single_block_uses_one_thread() {
        let mut buf = vec![0u8; 100];
        let calls = AtomicUsize::new(0);
        process(&mut buf, 0, BLOCK, |slice, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReadOutcome {
                bytes_read: slice.len(),
                errors_corrected: 0,
            })
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_one_failing_partition_fails_the_call() {
        let mut buf = vec![0u8; 16 * 4096];
        let calls = AtomicUsize::new(0);

        // Count partitions first so the failing run can prove every thread
        // still ran to completion.
        let partitions = {
            let ranges = Mutex::new(Vec::new());
            let mut scratch = vec![0u8; 16 * 4096];
            process(&mut scratch, 0, BLOCK, |slice, offset| {
                ranges.lock().push(offset);
                Ok(ReadOutcome {
                    bytes_read: slice.len(),
                    errors_corrected: 0,
                })
            })
            .unwrap();
            ranges.into_inner().len()
        };

        let result = process(&mut buf, 0, BLOCK, |slice, offset| {
            calls.fetch_add(1, Ordering::SeqCst);
            if offset == 0 {
                Err(Error::CorrectionFailed {
                    offset,
                    reason: "injected".into(),
                })
            } else {
                Ok(ReadOutcome {
                    bytes_read: slice.len(),
                    errors_corrected: 0,
                })
            }
        });

        assert!(matches!(result, Err(Error::CorrectionFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), partitions);
    }
}
