//! On-disk verity metadata header
//!
//! A fixed 32 KiB metadata region holds a little-endian binary header
//! followed by the dm-verity table as ASCII text. The header's magic doubles
//! as the enabled/disabled switch: a deliberately disabled device carries the
//! disable sentinel in the raw bytes, which is why disabled detection must
//! never look at an error-corrected copy.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Magic of an enabled verity device
pub const VERITY_MAGIC: u32 = 0xb001_b001;

/// Magic of a deliberately disabled verity device
pub const VERITY_MAGIC_DISABLE: u32 = 0x4646_4f56;

/// The only supported header version
pub const VERITY_VERSION: u32 = 0;

/// Size of the opaque signature blob (RSA-2048 modulus)
pub const SIGNATURE_SIZE: usize = 256;

/// Serialized header size: magic + version + signature + length
pub const HEADER_SIZE: usize = 4 + 4 + SIGNATURE_SIZE + 4;

/// Total metadata region size (header + table text)
pub const METADATA_SIZE: u64 = 8 * 4096;

/// Smallest table that could hold the required tokens
pub const MIN_TABLE_SIZE: u32 = 32;

/// Largest table the metadata region can hold
pub const MAX_TABLE_SIZE: u32 = METADATA_SIZE as u32 - HEADER_SIZE as u32;

// =============================================================================
// Verity Header
// =============================================================================

/// Parsed verity metadata header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityHeader {
    pub magic: u32,
    pub version: u32,
    /// Opaque table signature; carried, not verified here
    pub signature: Vec<u8>,
    /// Byte length of the table text that follows the header
    pub length: u32,
}

impl VerityHeader {
    /// Parse a header from the first `HEADER_SIZE` bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<LittleEndian>()?;
        let version = cursor.read_u32::<LittleEndian>()?;
        let mut signature = vec![0u8; SIGNATURE_SIZE];
        std::io::Read::read_exact(&mut cursor, &mut signature)?;
        let length = cursor.read_u32::<LittleEndian>()?;

        Ok(Self {
            magic,
            version,
            signature,
            length,
        })
    }

    /// Serialize back to the on-disk layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.length.to_le_bytes());
        out
    }

    /// True when the raw magic carries the disable sentinel.
    pub fn is_disabled(&self) -> bool {
        self.magic == VERITY_MAGIC_DISABLE
    }

    /// Validate magic, version and table length against the device bounds.
    pub fn validate(&self, offset: u64, device_size: u64) -> Result<()> {
        if self.magic != VERITY_MAGIC && self.magic != VERITY_MAGIC_DISABLE {
            return Err(Error::InvalidMagic { magic: self.magic });
        }
        if self.version != VERITY_VERSION {
            return Err(Error::UnsupportedVersion {
                version: self.version,
            });
        }
        let table_end = offset + HEADER_SIZE as u64 + self.length as u64;
        if self.length < MIN_TABLE_SIZE || self.length >= MAX_TABLE_SIZE || table_end > device_size
        {
            return Err(Error::InvalidTableLength {
                length: self.length,
                offset,
            });
        }
        Ok(())
    }
}
