//! Compression of spill segments (feature-gated backends).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Codec {
    #[default]
    None = 0,
    Zstd = 1,
    Lz4 = 2,
}

impl Codec {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zstd),
            2 => Ok(Codec::Lz4),
            _ => Err(Error::CodecUnsupported("unknown")),
        }
    }

    /// Parse `none`/`zstd`/`lz4`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Codec::None),
            "zstd" => Ok(Codec::Zstd),
            "lz4" => Ok(Codec::Lz4),
            _ => Err(Error::CodecUnsupported("unknown")),
        }
    }

    /// Whether this build carries the backend.
    pub fn is_available(self) -> bool {
        match self {
            Codec::None => true,
            Codec::Zstd => cfg!(feature = "zstd"),
            Codec::Lz4 => cfg!(feature = "lz4"),
        }
    }

    pub fn compress(self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(input.to_vec()),
            #[cfg(feature = "zstd")]
            Codec::Zstd => zstd::stream::encode_all(input, 3)
                .map_err(|e| Error::Codec(format!("zstd: {e}"))),
            #[cfg(feature = "lz4")]
            Codec::Lz4 => Ok(lz4_flex::compress_prepend_size(input)),
            #[allow(unreachable_patterns)]
            _ => Err(Error::CodecUnsupported(self.name())),
        }
    }

    pub fn decompress(self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(input.to_vec()),
            #[cfg(feature = "zstd")]
            Codec::Zstd => zstd::stream::decode_all(input)
                .map_err(|e| Error::Codec(format!("zstd: {e}"))),
            #[cfg(feature = "lz4")]
            Codec::Lz4 => lz4_flex::decompress_size_prepended(input)
                .map_err(|e| Error::Codec(format!("lz4: {e}"))),
            #[allow(unreachable_patterns)]
            _ => Err(Error::CodecUnsupported(self.name())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
        }
    }
}
