//! Checksum utilities for SlateFS
//!
//! Cached block files carry a CRC32C trailer so a torn or bit-rotted local
//! copy is detected before it is served. xxHash64 is used where a stable,
//! fast placement hash is needed.

use crate::error::{Error, Result};

/// Length of the trailer appended to checksummed blocks
pub const TRAILER_LEN: usize = 4;

/// CRC32C framing for block payloads stored on local disk
pub struct BlockChecksum;

impl BlockChecksum {
    /// Append a CRC32C trailer to `data`
    #[must_use]
    pub fn seal(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + TRAILER_LEN);
        out.extend_from_slice(data);
        out.extend_from_slice(&crc32c::crc32c(data).to_le_bytes());
        out
    }

    /// Verify a sealed buffer and return the payload
    ///
    /// `expected_len` is the payload length the caller expects; a buffer of
    /// any other length is reported as corrupt.
    pub fn open(sealed: &[u8], expected_len: usize) -> Result<&[u8]> {
        if sealed.len() != expected_len + TRAILER_LEN {
            return Err(Error::DataCorruption(format!(
                "expected {} bytes, found {}",
                expected_len + TRAILER_LEN,
                sealed.len()
            )));
        }
        let (payload, trailer) = sealed.split_at(expected_len);
        let mut raw = [0u8; TRAILER_LEN];
        raw.copy_from_slice(trailer);
        let expected = u32::from_le_bytes(raw);
        let actual = crc32c::crc32c(payload);
        if actual != expected {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        Ok(payload)
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
    }

    /// CRC32C of everything seen so far
    #[must_use]
    pub const fn crc32c(&self) -> u32 {
        self.crc32c
    }

    /// xxHash64 of everything seen so far
    #[must_use]
    pub fn xxhash64(&self) -> u64 {
        self.xxhash_state.digest()
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Seeded xxHash64, used for stable placement decisions
#[inline]
#[must_use]
pub fn placement_hash(data: &[u8], seed: u64) -> u64 {
    xxhash_rust::xxh64::xxh64(data, seed)
}
