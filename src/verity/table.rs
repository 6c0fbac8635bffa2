//! Verity table parsing
//!
//! The table is whitespace-separated ASCII with positional fields, the exact
//! text handed to device-mapper. Only the fields this core consumes are
//! interpreted; device paths and any tokens past the salt are carried but
//! ignored.

use tracing::debug;

use crate::digest::HashAlgorithm;
use crate::error::{Error, Result};
use crate::BLOCK_SIZE;

/// Tokens a table must have before positional parsing is possible
pub const REQUIRED_TOKENS: usize = 10;

/// The supported table format version literal
pub const TABLE_VERSION: &str = "1";

// =============================================================================
// Verity Table
// =============================================================================

/// Parsed dm-verity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTable {
    pub data_block_size: u64,
    pub hash_block_size: u64,
    pub num_data_blocks: u64,
    /// Byte offset of the hash tree (scaled from the block index token)
    pub hash_start: u64,
    pub algorithm: HashAlgorithm,
    pub root_digest: Vec<u8>,
    pub salt: Vec<u8>,
    /// Original table text, retained for the handle's lifetime
    pub raw: String,
}

impl VerityTable {
    /// Parse and validate table text against the device size.
    pub fn parse(bytes: &[u8], device_size: u64) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| Error::InvalidTableField {
            field: "table",
            value: "<non-ascii>".to_string(),
        })?;
        // The metadata region is zero padded past the table text.
        let text = text.trim_end_matches('\0');

        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() < REQUIRED_TOKENS {
            return Err(Error::TableTooShort {
                found: tokens.len(),
                required: REQUIRED_TOKENS,
            });
        }

        if tokens[0] != TABLE_VERSION {
            return Err(Error::InvalidTableField {
                field: "version",
                value: tokens[0].to_string(),
            });
        }

        let data_block_size = parse_u64("data_block_size", tokens[3])?;
        let hash_block_size = parse_u64("hash_block_size", tokens[4])?;
        if data_block_size != BLOCK_SIZE || hash_block_size != BLOCK_SIZE {
            return Err(Error::UnsupportedBlockSize(data_block_size));
        }

        let num_data_blocks = parse_u64("num_data_blocks", tokens[5])?;
        if num_data_blocks == 0 || num_data_blocks > device_size / BLOCK_SIZE {
            return Err(Error::InvalidTableField {
                field: "num_data_blocks",
                value: tokens[5].to_string(),
            });
        }

        let hash_start = parse_u64("hash_start", tokens[6])? * BLOCK_SIZE;

        let algorithm = HashAlgorithm::from_name(tokens[7])?;
        if algorithm != HashAlgorithm::Sha256 {
            // The metadata format contract pins sha256 even though the
            // builder supports more.
            return Err(Error::UnsupportedAlgorithm(tokens[7].to_string()));
        }

        let root_digest = hex::decode(tokens[8]).map_err(|_| Error::InvalidTableField {
            field: "root_digest",
            value: tokens[8].to_string(),
        })?;
        if root_digest.len() != algorithm.digest_size() {
            return Err(Error::InvalidTableField {
                field: "root_digest",
                value: tokens[8].to_string(),
            });
        }

        let salt = hex::decode(tokens[9]).map_err(|_| Error::InvalidTableField {
            field: "salt",
            value: tokens[9].to_string(),
        })?;

        debug!(
            num_data_blocks,
            hash_start,
            algorithm = algorithm.name(),
            "verity table parsed"
        );

        Ok(Self {
            data_block_size,
            hash_block_size,
            num_data_blocks,
            hash_start,
            algorithm,
            root_digest,
            salt,
            raw: text.to_string(),
        })
    }
}

fn parse_u64(field: &'static str, token: &str) -> Result<u64> {
    token.parse().map_err(|_| Error::InvalidTableField {
        field,
        value: token.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
