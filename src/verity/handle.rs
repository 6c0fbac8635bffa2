//! Verity device handle
//!
//! One handle per open of the underlying storage. The handle owns the parsed
//! metadata, the erasure-correction codec, the cumulative corrected-error
//! counter and, once the tree walk has run, the verified base-level hash
//! cache that later per-block reads consult.
//!
//! `parse_header` drives the metadata state machine:
//!
//! ```text
//! ReadRaw → DetectDisabled → ValidateOrFallback → ParseTable
//!     → VerifyTree → SelfHeal → ClipVisibleSize
//! ```
//!
//! Corrections that parsing could not avoid are healed back to storage on a
//! best-effort basis when the handle is writable; verification failures that
//! survive correction are fatal to the parse.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::fec::{CorrectionCodec, EccInfo, InterleavedRsCodec};
use crate::verity::header::{VerityHeader, HEADER_SIZE, VERITY_MAGIC_DISABLE};
use crate::verity::table::VerityTable;
use crate::verity::verifier;

// =============================================================================
// Open Options
// =============================================================================

/// How to open a verity device.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerityOpenOptions {
    /// Open read/write and allow self-healing rewrites
    pub writable: bool,
    /// Parse metadata but skip the hash tree walk
    pub skip_tree_verify: bool,
}

/// Self-heal bookkeeping, guarded by the handle mutex.
#[derive(Debug, Default)]
struct HealLog {
    rewrites: u64,
    failed_rewrites: u64,
}

// =============================================================================
// Verity Handle
// =============================================================================

/// Handle to a verity-protected device file.
pub struct VerityHandle {
    file: File,
    device_size: u64,
    writable: bool,
    skip_tree_verify: bool,
    disabled: bool,
    metadata_start: u64,
    /// Externally visible data size, clipped so the payload never overlaps
    /// the metadata or tree describing it
    data_size: u64,
    header: Option<VerityHeader>,
    table: Option<VerityTable>,
    codec: Option<Box<dyn CorrectionCodec>>,
    /// Cumulative blocks recovered through error correction
    error_count: AtomicU64,
    /// Verified base-level digests, one slot per data block
    pub(crate) hash_cache: Vec<u8>,
    /// Raw digest of an all-zero block
    pub(crate) zero_digest: Vec<u8>,
    heal: Mutex<HealLog>,
}

impl VerityHandle {
    /// Open a device file. Metadata is not touched until `parse_header`.
    pub fn open<P: AsRef<Path>>(path: P, options: VerityOpenOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(options.writable)
            .open(path)?;
        let device_size = file.metadata()?.len();

        Ok(Self {
            file,
            device_size,
            writable: options.writable,
            skip_tree_verify: options.skip_tree_verify,
            disabled: false,
            metadata_start: 0,
            data_size: device_size,
            header: None,
            table: None,
            codec: None,
            error_count: AtomicU64::new(0),
            hash_cache: Vec::new(),
            zero_digest: Vec::new(),
            heal: Mutex::new(HealLog::default()),
        })
    }

    /// Attach the production Reed-Solomon codec for the given parity region.
    pub fn attach_ecc(&mut self, info: EccInfo) -> Result<()> {
        self.codec = Some(Box::new(InterleavedRsCodec::new(info)?));
        Ok(())
    }

    /// Attach a custom correction codec.
    pub fn set_codec(&mut self, codec: Box<dyn CorrectionCodec>) {
        self.codec = Some(codec);
    }

    // =========================================================================
    // Metadata Parsing
    // =========================================================================

    /// Locate, validate and (if needed) repair the verity metadata at
    /// `offset`, then verify the hash tree it describes.
    #[instrument(skip(self))]
    pub fn parse_header(&mut self, offset: u64) -> Result<()> {
        self.metadata_start = offset;

        // Raw header plus an unconditional error-corrected copy.
        let mut raw_bytes = vec![0u8; HEADER_SIZE];
        self.raw_read_at(&mut raw_bytes, offset)?;
        let raw_header = VerityHeader::parse(&raw_bytes)?;

        let ecc_header = self.codec.as_ref().and_then(|codec| {
            let mut bytes = vec![0u8; HEADER_SIZE];
            codec.correct(&self.file, &mut bytes, offset).ok()?;
            VerityHeader::parse(&bytes).ok()
        });

        // Disabled detection uses the raw bytes only: a "correction" could
        // otherwise mask a deliberately disabled marker.
        if raw_header.is_disabled() {
            info!("verity is disabled on this device");
            self.disabled = true;
        }

        let mut corrections = 0u64;
        let header = match raw_header.validate(offset, self.device_size) {
            Ok(()) => match &ecc_header {
                Some(ecc)
                    if ecc.validate(offset, self.device_size).is_ok()
                        && (ecc.version != raw_header.version
                            || ecc.length != raw_header.length) =>
                {
                    warn!("verity header disagrees with its ecc copy, adopting corrected fields");
                    corrections += 1;
                    VerityHeader {
                        magic: raw_header.magic,
                        version: ecc.version,
                        signature: ecc.signature.clone(),
                        length: ecc.length,
                    }
                }
                _ => raw_header,
            },
            Err(raw_err) => {
                let adopted = ecc_header
                    .filter(|ecc| ecc.validate(offset, self.device_size).is_ok());
                match adopted {
                    Some(ecc) => {
                        warn!(error = %raw_err, "verity header invalid, using ecc-corrected copy");
                        corrections += 1;
                        ecc
                    }
                    None => return Err(raw_err),
                }
            }
        };

        // Table text: plain read first, corrected retry only if that copy
        // fails to decode.
        let table_offset = offset + HEADER_SIZE as u64;
        let mut table_bytes = vec![0u8; header.length as usize];
        self.raw_read_at(&mut table_bytes, table_offset)?;
        let table = match VerityTable::parse(&table_bytes, self.device_size) {
            Ok(table) => table,
            Err(parse_err) => match &self.codec {
                Some(codec) => {
                    warn!(error = %parse_err, "verity table invalid, retrying with error correction");
                    codec.correct(&self.file, &mut table_bytes, table_offset)?;
                    let table = VerityTable::parse(&table_bytes, self.device_size)?;
                    corrections += 1;
                    table
                }
                None => return Err(parse_err),
            },
        };

        let hash_start = table.hash_start;
        let data_blocks = table.num_data_blocks;

        if !self.skip_tree_verify && !self.disabled {
            verifier::verify_tree(self, &table)?;
        }

        self.header = Some(header);
        self.table = Some(table);

        if corrections > 0 {
            self.add_corrected(corrections);
            self.heal_metadata(offset);
        }

        self.data_size = self
            .metadata_start
            .min(hash_start)
            .min(data_blocks * crate::BLOCK_SIZE);

        debug!(
            data_size = self.data_size,
            disabled = self.disabled,
            "verity metadata parsed"
        );
        Ok(())
    }

    /// Best-effort rewrite of corrected metadata back to raw storage.
    fn heal_metadata(&self, offset: u64) {
        if !self.writable {
            return;
        }
        let (Some(header), Some(table)) = (&self.header, &self.table) else {
            return;
        };

        // A disabled device stays disabled on disk no matter what the
        // corrected header says.
        let mut header = header.clone();
        if self.disabled {
            header.magic = VERITY_MAGIC_DISABLE;
        }

        let mut bytes = header.encode();
        bytes.extend_from_slice(table.raw.as_bytes());
        match self.raw_write_at(&bytes, offset) {
            Ok(()) => {
                info!(offset, "rewrote corrected verity metadata");
                self.heal.lock().rewrites += 1;
            }
            Err(e) => {
                warn!(offset, error = %e, "failed to rewrite corrected verity metadata");
                self.heal.lock().failed_rewrites += 1;
            }
        }
    }

    /// Best-effort rewrite of a corrected tree block.
    pub(crate) fn persist_block(&self, bytes: &[u8], offset: u64) {
        if !self.writable {
            return;
        }
        match self.raw_write_at(bytes, offset) {
            Ok(()) => {
                debug!(offset, "rewrote corrected block");
                self.heal.lock().rewrites += 1;
            }
            Err(e) => {
                warn!(offset, error = %e, "failed to rewrite corrected block");
                self.heal.lock().failed_rewrites += 1;
            }
        }
    }

    // =========================================================================
    // Raw I/O
    // =========================================================================

    pub(crate) fn raw_read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn raw_write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn codec(&self) -> Option<&dyn CorrectionCodec> {
        self.codec.as_deref()
    }

    pub(crate) fn set_hash_cache(&mut self, cache: Vec<u8>, zero_digest: Vec<u8>) {
        self.hash_cache = cache;
        self.zero_digest = zero_digest;
    }

    pub(crate) fn add_corrected(&self, n: u64) {
        if n > 0 {
            self.error_count.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Blocks recovered through error correction over the handle's lifetime.
    pub fn corrected_errors(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Successful and failed self-heal rewrites.
    pub fn heal_counts(&self) -> (u64, u64) {
        let log = self.heal.lock();
        (log.rewrites, log.failed_rewrites)
    }

    /// True when the raw metadata carried the disable sentinel.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Externally visible data size.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn header(&self) -> Option<&VerityHeader> {
        self.header.as_ref()
    }

    pub fn table(&self) -> Option<&VerityTable> {
        self.table.as_ref()
    }

    /// Root digest from the parsed table.
    pub fn root_hash(&self) -> Option<&[u8]> {
        self.table.as_ref().map(|t| t.root_digest.as_slice())
    }
}

// =============================================================================
// Tests
// =============================================================================
