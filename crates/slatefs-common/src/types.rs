//! Core identities for SlateFS
//!
//! ```text
//! Chunk 7 (64 MiB logical range, owned by the metadata engine)
//! ├── Slice 1001  pos=0      size=10 MiB  → blocks 1001_0_4194304, 1001_1_4194304, 1001_2_2097152
//! ├── Slice 1002  pos=1 MiB  size=4 KiB   → block  1002_0_4096
//! └── ...         (later slices win where they overlap earlier ones)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical chunk identifier, assigned by the metadata engine
pub type ChunkId = u64;

/// Identifier of one sealed slice's object series, assigned by the metadata engine
pub type SliceId = u64;

/// Size of a logical chunk: 64 MiB
pub const CHUNK_SIZE: u64 = 64 << 20;

/// Default block size: 4 MiB
pub const DEFAULT_BLOCK_SIZE: u32 = 4 << 20;

/// A contiguous write within a chunk, backed by an immutable object series
///
/// `size` is the length of the stored object; `off`/`len` select the window
/// of that object this slice refers to, placed at `pos` within the chunk.
/// A freshly sealed slice refers to its whole object (`off == 0`,
/// `len == size`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slice {
    /// Object series identifier
    pub id: SliceId,
    /// Owning chunk
    pub chunk_id: ChunkId,
    /// Offset of the referenced window within the chunk
    pub pos: u32,
    /// Total length of the stored object
    pub size: u32,
    /// Offset of the referenced window within the object
    pub off: u32,
    /// Length of the referenced window
    pub len: u32,
}

impl Slice {
    /// A slice referring to a whole object placed at `pos`
    #[must_use]
    pub const fn new(id: SliceId, chunk_id: ChunkId, pos: u32, size: u32) -> Self {
        Self {
            id,
            chunk_id,
            pos,
            size,
            off: 0,
            len: size,
        }
    }

    /// End of the referenced window within the chunk (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.pos as u64 + self.len as u64
    }

    /// Whether `[start, end)` within the chunk overlaps this slice
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        (self.pos as u64) < end && start < self.end()
    }

    /// All blocks of the underlying object
    #[must_use]
    pub fn blocks(&self, block_size: u32) -> Vec<BlockId> {
        BlockId::for_object(self.id, self.size, block_size)
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slice {} (chunk {} pos {} len {}, object {}+{}/{})",
            self.id, self.chunk_id, self.pos, self.len, self.off, self.len, self.size
        )
    }
}

/// One immutable block of a slice's object series
///
/// Block `index` covers object bytes `[index * block_size, index * block_size + size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    /// Owning object series
    pub slice_id: SliceId,
    /// Index of the block within the object
    pub index: u32,
    /// Length of this block in bytes
    pub size: u32,
}

impl BlockId {
    #[must_use]
    pub const fn new(slice_id: SliceId, index: u32, size: u32) -> Self {
        Self {
            slice_id,
            index,
            size,
        }
    }

    /// Enumerate the blocks of an object of `object_size` bytes
    ///
    /// Every block but the last is `block_size` long.
    #[must_use]
    pub fn for_object(slice_id: SliceId, object_size: u32, block_size: u32) -> Vec<Self> {
        if object_size == 0 || block_size == 0 {
            return Vec::new();
        }
        let count = object_size.div_ceil(block_size);
        (0..count)
            .map(|index| {
                let start = index * block_size;
                let size = block_size.min(object_size - start);
                Self::new(slice_id, index, size)
            })
            .collect()
    }

    /// Offset of the first byte of this block within its object
    #[must_use]
    pub const fn object_offset(&self, block_size: u32) -> u64 {
        self.index as u64 * block_size as u64
    }

    /// Object storage key for this block
    ///
    /// Keys fan out over two directory levels so that no prefix holds more
    /// than a thousand slices.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "chunks/{}/{}/{}",
            self.slice_id / 1_000_000,
            self.slice_id / 1_000,
            self.file_name()
        )
    }

    /// Final path component of the key: `{slice}_{index}_{size}`
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}_{}_{}", self.slice_id, self.index, self.size)
    }

    /// Parse a key (or just its final component) back into a block identity
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let name = key.rsplit('/').next()?;
        let mut parts = name.split('_');
        let slice_id = parts.next()?.parse().ok()?;
        let index = parts.next()?.parse().ok()?;
        let size = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(slice_id, index, size))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_key_layout() {
        let block = BlockId::new(1_234_567, 2, 4096);
        assert_eq!(block.key(), "chunks/1/1234/1234567_2_4096");
        assert_eq!(block.file_name(), "1234567_2_4096");
    }

    #[test]
    fn test_block_parse() {
        let block = BlockId::new(42, 7, 1 << 20);
        assert_eq!(BlockId::parse(&block.key()), Some(block));
        assert_eq!(BlockId::parse("42_7_1048576"), Some(block));
        assert_eq!(BlockId::parse("chunks/0/0/42_7"), None);
        assert_eq!(BlockId::parse("chunks/0/0/42_7_9_1"), None);
        assert_eq!(BlockId::parse("chunks/0/0/abc_1_2"), None);
    }

    #[test]
    fn test_blocks_for_object() {
        let blocks = BlockId::for_object(9, 10, 4);
        assert_eq!(
            blocks,
            vec![
                BlockId::new(9, 0, 4),
                BlockId::new(9, 1, 4),
                BlockId::new(9, 2, 2)
            ]
        );
        assert_eq!(blocks[2].object_offset(4), 8);

        assert_eq!(BlockId::for_object(9, 8, 4).len(), 2);
        assert!(BlockId::for_object(9, 0, 4).is_empty());
    }

    #[test]
    fn test_slice_window() {
        let slice = Slice::new(5, 1, 100, 50);
        assert_eq!(slice.end(), 150);
        assert!(slice.overlaps(149, 200));
        assert!(!slice.overlaps(150, 200));
        assert!(!slice.overlaps(0, 100));
        assert_eq!(slice.blocks(32).len(), 2);
    }
}
