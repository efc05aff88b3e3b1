//! Block compression
//!
//! Every stored block starts with a one-byte codec tag, so blocks stay
//! decodable after the configured algorithm changes. Compression is
//! block-local: no dictionary is shared across blocks.

use crate::error::{ChunkError, ChunkResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

const ZSTD_LEVEL: i32 = 1;

/// Block compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl FromStr for Compression {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(ChunkError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

/// Compress a block and prepend the codec tag
pub fn compress(compression: Compression, data: &[u8]) -> ChunkResult<Vec<u8>> {
    let (tag, body) = match compression {
        Compression::None => (TAG_NONE, None),
        Compression::Lz4 => (TAG_LZ4, Some(lz4_flex::compress_prepend_size(data))),
        Compression::Zstd => {
            let out = zstd::bulk::compress(data, ZSTD_LEVEL)
                .map_err(|e| ChunkError::Compression(format!("zstd compress: {e}")))?;
            (TAG_ZSTD, Some(out))
        }
    };
    let body = body.as_deref().unwrap_or(data);
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decompress a tagged block of `expected_len` bytes
///
/// Output of any other length is an error; the caller treats it as
/// corruption.
pub fn decompress(data: &[u8], expected_len: usize) -> ChunkResult<Vec<u8>> {
    let Some((&tag, body)) = data.split_first() else {
        return Err(ChunkError::Compression("empty block".into()));
    };
    let out = match tag {
        TAG_NONE => body.to_vec(),
        TAG_LZ4 => {
            if body.len() < 4 {
                return Err(ChunkError::Compression("lz4 header truncated".into()));
            }
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&body[..4]);
            let declared = u32::from_le_bytes(raw) as usize;
            if declared != expected_len {
                return Err(ChunkError::Compression(format!(
                    "lz4 declares {declared} bytes, expected {expected_len}"
                )));
            }
            lz4_flex::decompress_size_prepended(body)
                .map_err(|e| ChunkError::Compression(format!("lz4 decompress: {e}")))?
        }
        TAG_ZSTD => zstd::bulk::decompress(body, expected_len)
            .map_err(|e| ChunkError::Compression(format!("zstd decompress: {e}")))?,
        other => {
            return Err(ChunkError::Compression(format!(
                "unknown codec tag 0x{other:02x}"
            )));
        }
    };
    if out.len() != expected_len {
        return Err(ChunkError::Compression(format!(
            "decoded {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}
