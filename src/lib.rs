//! Veritree - Verified Block-Storage Integrity Core
//!
//! A local, single-host storage integrity layer: a streaming Merkle hash
//! tree builder for creating dm-verity images, and a self-healing verified
//! reader that parses verity metadata, walks the on-disk tree, and recovers
//! corrupted blocks through Reed-Solomon error correction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  build time                      read time                       │
//! │  ┌────────────────┐              ┌──────────────────────────┐   │
//! │  │ HashTreeBuilder│─── tree ────▶│ VerityHandle             │   │
//! │  │  (streaming)   │              │  parse → verify → read   │   │
//! │  └───────┬────────┘              └──────┬──────────┬────────┘   │
//! │          │                              │          │            │
//! │     ┌────▼────┐                  ┌──────▼───┐ ┌────▼─────────┐  │
//! │     │ Digest  │                  │ Parallel │ │ Correction   │  │
//! │     │ Adapter │                  │ Processor│ │ Codec (RS)   │  │
//! │     └─────────┘                  └──────────┘ └──────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`digest`] - Salted block digests, selectable by algorithm name
//! - [`error`] - Error types
//! - [`fec`] - Erasure-code region model and correction codec
//! - [`hashtree`] - Merkle tree geometry and the streaming builder
//! - [`process`] - Thread-partitioned block range processor
//! - [`verity`] - Metadata parsing, tree verification, verified reads

pub mod digest;
pub mod error;
pub mod fec;
pub mod hashtree;
pub mod process;
pub mod verity;

// Re-export commonly used types
pub use digest::HashAlgorithm;
pub use error::{Error, Result};
pub use fec::{CorrectionCodec, EccInfo, InterleavedRsCodec};
pub use hashtree::{HashTreeBuilder, TreeGeometry};
pub use process::ReadOutcome;
pub use verity::{VerityHandle, VerityHeader, VerityOpenOptions, VerityTable};

/// Fixed block size of the verity format.
pub const BLOCK_SIZE: u64 = 4096;
