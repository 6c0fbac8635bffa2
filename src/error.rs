//! Error types for the verified block-storage core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the verified block-storage core
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Format Errors
    // =========================================================================
    /// Verity header magic is neither the enabled nor the disabled sentinel
    #[error("Invalid verity header magic: {magic:#010x}")]
    InvalidMagic { magic: u32 },

    /// Verity header version is unsupported
    #[error("Unsupported verity header version: {version}")]
    UnsupportedVersion { version: u32 },

    /// Verity table length field is out of bounds
    #[error("Verity table length {length} out of bounds at offset {offset}")]
    InvalidTableLength { length: u32, offset: u64 },

    /// Verity table has fewer than the required number of tokens
    #[error("Verity table has {found} tokens, need at least {required}")]
    TableTooShort { found: usize, required: usize },

    /// Verity table field failed to parse
    #[error("Invalid verity table field {field:?}: {value:?}")]
    InvalidTableField { field: &'static str, value: String },

    /// Block size other than the supported fixed size
    #[error("Unsupported block size: {0}")]
    UnsupportedBlockSize(u64),

    /// Digest algorithm name not supported
    #[error("Unsupported digest algorithm: {0:?}")]
    UnsupportedAlgorithm(String),

    /// Input size is not a multiple of the block size
    #[error("Size {size} is not a multiple of block size {block_size}")]
    NotBlockAligned { size: u64, block_size: u64 },

    /// Streamed more (or fewer) bytes than the builder was initialized for
    #[error("Streamed data does not match expected size: got {streamed}, expected {expected}")]
    StreamSizeMismatch { streamed: u64, expected: u64 },

    /// Serialized hash tree does not match the expected layout
    #[error("Hash tree size mismatch: expected {expected} bytes, got {actual}")]
    TreeSizeMismatch { expected: usize, actual: usize },

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Root digest did not match even after error correction
    #[error("Root hash invalid at hash offset {hash_offset}")]
    RootHashInvalid { hash_offset: u64 },

    /// A tree block digest did not match even after error correction
    #[error("Hash tree verification failed at level {level}, block {block}")]
    TreeBlockInvalid { level: usize, block: u64 },

    /// A data block digest did not match even after error correction
    #[error("Data block {block} failed verification at offset {offset}")]
    DataBlockInvalid { block: u64, offset: u64 },

    /// Built hash tree differs from the supplied serialized tree
    #[error("Hash tree mismatch at level {level}, byte offset {offset}")]
    TreeMismatch { level: usize, offset: usize },

    // =========================================================================
    // Resource / Concurrency Errors
    // =========================================================================
    /// Thread spawn failure inside the parallel block processor
    #[error("Failed to spawn read thread: {0}")]
    ThreadSpawn(String),

    /// A read worker thread panicked before reporting a result
    #[error("Read thread panicked")]
    ThreadJoin,

    /// Erasure-code correction could not reconstruct the requested range
    #[error("Error correction failed at offset {offset}: {reason}")]
    CorrectionFailed { offset: u64, reason: String },

    /// Erasure-code region parameters are invalid
    #[error("Invalid ECC configuration: {0}")]
    InvalidEccConfig(String),
}
