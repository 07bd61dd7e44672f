//! Device identification from the hardware/software build-id item.
//!
//! The item layout has grown field by field over chip generations; only
//! the leading format/id/version words are always present, later fields are
//! gated on the item being large enough to contain them.

use smem::{Smem, HOST_ANY};

use crate::{PlatformError, Result};

/// Well-known item id of the build-id record.
pub const ITEM_BUILD_ID: u16 = 137;

/// Byte offset of the serial number within the record.
const SERIAL_NUMBER_OFFSET: usize = 96;

/// The decoded identification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocInfo {
    /// Record format revision.
    pub format: u32,
    /// SoC identifier.
    pub id: u32,
    /// SoC revision.
    pub version: u32,
    serial: Option<u32>,
}

impl SocInfo {
    /// Device serial number, when this record revision carries one.
    pub fn serial_number(&self) -> Option<u32> {
        self.serial
    }
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Read and decode the build-id item.
pub fn read(smem: &Smem) -> Result<SocInfo> {
    let item = smem.get(HOST_ANY, ITEM_BUILD_ID)?;
    let bytes = item.as_bytes();
    if bytes.len() < 12 {
        return Err(PlatformError::Truncated);
    }

    let serial = if bytes.len() >= SERIAL_NUMBER_OFFSET + 4 {
        Some(le32(bytes, SERIAL_NUMBER_OFFSET))
    } else {
        None
    };

    Ok(SocInfo {
        format: le32(bytes, 0),
        id: le32(bytes, 4),
        version: le32(bytes, 8),
        serial,
    })
}
