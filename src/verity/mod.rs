//! Verity metadata parsing and verified reading
//!
//! - [`header`] - Binary metadata header and its sentinels
//! - [`table`] - ASCII dm-verity table parsing
//! - [`handle`] - Device handle and the metadata parse state machine
//! - [`verifier`] - Top-down hash tree walk
//! - [`read`] - Verified read path with error-corrected fallback

pub mod handle;
pub mod header;
pub mod read;
pub mod table;
pub mod verifier;

pub use handle::{VerityHandle, VerityOpenOptions};
pub use header::VerityHeader;
pub use table::VerityTable;
