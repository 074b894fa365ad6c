//! Spill segment header and metadata.
//!
//! Layout:
//! [ magic: u32 ][ version: u16 ][ codec: u8 ][ reserved: u8 ]
//! [ nrows: u32 ][ uncompressed_len: u64 ][ compressed_len: u64 ]
//! [ payload bytes … ]
//!
//! The checksum kept in [`SegmentMeta`] covers (header || payload), blake3.

use serde::{Deserialize, Serialize};

use super::Codec;
use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x474A_5350; // "GJSP"
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 4 + 8 + 8;

/// Largest payload a reader will accept before trusting the header.
pub const MAX_SEGMENT_BYTES: u64 = 256 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub codec: Codec,
    pub nrows: u32,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
}

impl SegmentHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[6] = self.codec as u8;
        out[8..12].copy_from_slice(&self.nrows.to_le_bytes());
        out[12..20].copy_from_slice(&self.uncompressed_len.to_le_bytes());
        out[20..28].copy_from_slice(&self.compressed_len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let field = |lo: usize, hi: usize| -> Result<&[u8]> {
            bytes
                .get(lo..hi)
                .ok_or_else(|| Error::Storage("short segment header".into()))
        };
        let magic = u32::from_le_bytes(le(field(0, 4)?)?);
        let version = u16::from_le_bytes(le(field(4, 6)?)?);
        if magic != MAGIC || version != VERSION {
            return Err(Error::Storage(format!(
                "bad segment magic/version {magic:#x}/{version}"
            )));
        }
        let header = Self {
            codec: Codec::from_u8(field(6, 7)?[0])?,
            nrows: u32::from_le_bytes(le(field(8, 12)?)?),
            uncompressed_len: u64::from_le_bytes(le(field(12, 20)?)?),
            compressed_len: u64::from_le_bytes(le(field(20, 28)?)?),
        };
        header.validate_sizes()?;
        Ok(header)
    }

    /// Reject sizes no writer of this crate produces.
    pub fn validate_sizes(&self) -> Result<()> {
        if self.uncompressed_len > MAX_SEGMENT_BYTES || self.compressed_len > MAX_SEGMENT_BYTES {
            return Err(Error::Storage(format!(
                "segment sizes {}/{} exceed {}",
                self.uncompressed_len, self.compressed_len, MAX_SEGMENT_BYTES
            )));
        }
        Ok(())
    }
}

fn le<const N: usize>(s: &[u8]) -> Result<[u8; N]> {
    s.try_into()
        .map_err(|_| Error::Storage("short segment header".into()))
}

/// Metadata the spill keeps for one written segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub path: String,
    pub nrows: u32,
    pub total_len: usize,
    pub checksum: [u8; 32],
}
