//! On-disk hash tree verification
//!
//! Walks the tree top-down. The root block is checked against the table's
//! root digest; every lower block is checked against the digest slot held in
//! the already-verified level above it. Mismatches retry through the
//! error-corrected read path; a mismatch that survives correction is fatal.
//!
//! The base level — the direct digests of the data blocks — is retained as
//! the handle's hash cache, so later reads verify blocks against memory
//! instead of re-walking the tree.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::hashtree::TreeGeometry;
use crate::verity::handle::VerityHandle;
use crate::verity::read::{read_corrected, VerifiedRead};
use crate::verity::table::VerityTable;
use crate::BLOCK_SIZE;

/// Verify the tree described by `table` and populate the handle's hash
/// cache. Runs single-threaded, before any concurrent reader may use the
/// handle.
pub(crate) fn verify_tree(handle: &mut VerityHandle, table: &VerityTable) -> Result<()> {
    let algorithm = table.algorithm;
    let salt = table.salt.as_slice();
    let geometry = TreeGeometry::new(
        table.num_data_blocks * BLOCK_SIZE,
        BLOCK_SIZE,
        algorithm.slot_size() as u64,
    );

    let tree_end = table.hash_start + geometry.tree_size();
    if tree_end > handle.device_size() {
        return Err(Error::InvalidTableField {
            field: "hash_start",
            value: table.hash_start.to_string(),
        });
    }

    let block = BLOCK_SIZE as usize;
    let slot_size = algorithm.slot_size();

    // Root: the single top-level block, checked against the table root.
    let top_level = geometry.num_levels() - 1;
    let root_offset = table.hash_start + geometry.level_offset(top_level);
    let mut top = vec![0u8; block];
    let status = read_corrected(handle, &mut top, root_offset, |bytes| {
        algorithm.salted_digest(salt, bytes) == table.root_digest
    })?;
    match status {
        VerifiedRead::Clean => {}
        VerifiedRead::Corrected => {
            handle.add_corrected(1);
            handle.persist_block(&top, root_offset);
        }
        VerifiedRead::Failed => {
            warn!(offset = root_offset, "root hash invalid");
            return Err(Error::RootHashInvalid {
                hash_offset: table.hash_start,
            });
        }
    }

    // Lower levels, top-down. Each block's digest slot comes from the
    // verified parent level held in memory.
    let mut parent = top;
    for level in (0..top_level).rev() {
        let level_offset = table.hash_start + geometry.level_offset(level);
        let mut level_buf = vec![0u8; geometry.level_size(level) as usize];

        for index in 0..geometry.blocks_at(level) {
            let slot = &parent[index as usize * slot_size..][..slot_size];
            let buf = &mut level_buf[index as usize * block..][..block];
            let block_offset = level_offset + index * BLOCK_SIZE;

            let status = read_corrected(handle, buf, block_offset, |bytes| {
                algorithm.slot_matches(slot, &algorithm.salted_digest(salt, bytes))
            })?;
            match status {
                VerifiedRead::Clean => {}
                VerifiedRead::Corrected => {
                    handle.add_corrected(1);
                    handle.persist_block(buf, block_offset);
                }
                VerifiedRead::Failed => {
                    warn!(level, block = index, "hash tree block invalid");
                    return Err(Error::TreeBlockInvalid {
                        level,
                        block: index,
                    });
                }
            }
        }
        parent = level_buf;
    }

    // `parent` is now the base level: one digest slot per data block.
    let zero_digest = algorithm.salted_digest(salt, &vec![0u8; block]);
    handle.set_hash_cache(parent, zero_digest);

    info!(
        levels = geometry.num_levels(),
        blocks = table.num_data_blocks,
        "hash tree verified"
    );
    Ok(())
}
