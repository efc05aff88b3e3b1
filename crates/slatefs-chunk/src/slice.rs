//! Slices of a chunk: write buffering and overlap resolution
//!
//! A chunk is described by an ordered list of sealed slices (the
//! [`SliceTable`]); where slices overlap, the one later in the list wins.
//! Unsealed writes live in a per-chunk [`WriteBuffer`] and shadow every
//! sealed slice.
//!
//! ```text
//! table:   [ A: 0..4 "AAAA" ][ B: 1..3 "BB" ]
//! resolve: |A|B B|A|           -> "ABBA"
//! ```

use serde::{Deserialize, Serialize};
use slatefs_common::{Slice, SliceId};

/// Which of two overlapping slices wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// The slice committed later wins
    #[default]
    CommitOrder,
    /// The slice with the greater id wins
    SliceId,
}

/// Origin of the bytes of one resolved segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// No slice covers the range; reads as zeros
    Hole,
    /// Bytes of `slice`'s object starting at `object_off`
    Slice { slice: Slice, object_off: u64 },
}

/// A contiguous chunk range served by a single source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset within the chunk
    pub start: u64,
    pub len: u64,
    pub source: Source,
}

impl Segment {
    const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// The part of this segment within `[from, to)`, if any
    fn clip(&self, from: u64, to: u64) -> Option<Self> {
        let start = self.start.max(from);
        let end = self.end().min(to);
        if start >= end {
            return None;
        }
        let source = match self.source {
            Source::Hole => Source::Hole,
            Source::Slice { slice, object_off } => Source::Slice {
                slice,
                object_off: object_off + (start - self.start),
            },
        };
        Some(Self {
            start,
            len: end - start,
            source,
        })
    }
}

/// Resolve `[offset, offset + len)` against `layers`, lowest precedence first
///
/// The returned segments are sorted, disjoint and cover the whole range.
#[must_use]
pub fn resolve(layers: &[Slice], offset: u64, len: u64) -> Vec<Segment> {
    let end = offset + len;
    let mut segments = vec![Segment {
        start: offset,
        len,
        source: Source::Hole,
    }];
    if len == 0 {
        return Vec::new();
    }

    for slice in layers {
        let Some(top) = (Segment {
            start: u64::from(slice.pos),
            len: u64::from(slice.len),
            source: Source::Slice {
                slice: *slice,
                object_off: u64::from(slice.off),
            },
        })
        .clip(offset, end) else {
            continue;
        };

        let mut next = Vec::with_capacity(segments.len() + 2);
        let mut placed = false;
        for seg in &segments {
            if seg.end() <= top.start || seg.start >= top.end() {
                if !placed && seg.start >= top.end() {
                    next.push(top);
                    placed = true;
                }
                next.push(*seg);
                continue;
            }
            if let Some(left) = seg.clip(seg.start, top.start) {
                next.push(left);
            }
            if !placed {
                next.push(top);
                placed = true;
            }
            if let Some(right) = seg.clip(top.end(), seg.end()) {
                next.push(right);
            }
        }
        if !placed {
            next.push(top);
        }
        segments = next;
    }
    segments
}

/// Sealed slices of one chunk in precedence order (last wins)
#[derive(Debug, Clone, Default)]
pub struct SliceTable {
    slices: Vec<Slice>,
    /// Bumped on every change; readers use it to detect concurrent updates
    generation: u64,
}

impl SliceTable {
    /// Build a table from a slice list in commit order
    #[must_use]
    pub fn from_slices(mut slices: Vec<Slice>, precedence: Precedence) -> Self {
        if precedence == Precedence::SliceId {
            slices.sort_by_key(|s| s.id);
        }
        Self {
            slices,
            generation: 0,
        }
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn contains(&self, id: SliceId) -> bool {
        self.slices.iter().any(|s| s.id == id)
    }

    /// Add a newly sealed slice
    pub fn push(&mut self, slice: Slice, precedence: Precedence) {
        match precedence {
            Precedence::CommitOrder => self.slices.push(slice),
            Precedence::SliceId => {
                let at = self.slices.partition_point(|s| s.id <= slice.id);
                self.slices.insert(at, slice);
            }
        }
        self.generation += 1;
    }

    /// Replace the whole slice list, as when the metadata engine supplies it
    pub fn reset(&mut self, slices: Vec<Slice>, precedence: Precedence) {
        let generation = self.generation + 1;
        *self = Self::from_slices(slices, precedence);
        self.generation = generation;
    }

    /// Drop a slice; returns whether it was present
    pub fn remove(&mut self, id: SliceId) -> bool {
        let before = self.slices.len();
        self.slices.retain(|s| s.id != id);
        let removed = self.slices.len() != before;
        if removed {
            self.generation += 1;
        }
        removed
    }

    /// Inputs of a compaction that are still part of this table
    #[must_use]
    pub fn live(&self, inputs: &[SliceId]) -> Vec<Slice> {
        self.slices
            .iter()
            .filter(|s| inputs.contains(&s.id))
            .copied()
            .collect()
    }

    /// Slices whose combined view a compacted slice must reproduce
    ///
    /// The compacted slice takes the place of the newest input under
    /// `CommitOrder`, and the place of `new_id` under `SliceId`; everything
    /// below that place is folded into its content.
    #[must_use]
    pub fn compaction_layers(
        &self,
        live: &[SliceId],
        new_id: SliceId,
        precedence: Precedence,
    ) -> Vec<Slice> {
        let cut = match precedence {
            Precedence::CommitOrder => self
                .slices
                .iter()
                .rposition(|s| live.contains(&s.id))
                .map_or(0, |i| i + 1),
            Precedence::SliceId => self.slices.partition_point(|s| s.id < new_id),
        };
        self.slices[..cut].to_vec()
    }

    /// Swap the compaction inputs for the compacted slice
    ///
    /// Returns false when none of the inputs is present anymore.
    pub fn replace(&mut self, inputs: &[SliceId], merged: Slice, precedence: Precedence) -> bool {
        let Some(newest) = self.slices.iter().rposition(|s| inputs.contains(&s.id)) else {
            return false;
        };
        let before_newest = self.slices[..newest]
            .iter()
            .filter(|s| inputs.contains(&s.id))
            .count();
        self.slices.retain(|s| !inputs.contains(&s.id));
        match precedence {
            Precedence::CommitOrder => self.slices.insert(newest - before_newest, merged),
            Precedence::SliceId => {
                let at = self.slices.partition_point(|s| s.id <= merged.id);
                self.slices.insert(at, merged);
            }
        }
        self.generation += 1;
        true
    }
}

/// An unsealed contiguous write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSlice {
    /// Offset within the chunk
    pub pos: u32,
    pub data: Vec<u8>,
}

impl PendingSlice {
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.pos) + self.data.len() as u64
    }
}

/// Unsealed writes of one chunk, oldest first
#[derive(Debug, Default)]
pub struct WriteBuffer {
    pending: Vec<PendingSlice>,
}

impl WriteBuffer {
    /// Buffer a write; returns how many buffered bytes it added
    ///
    /// A write that overlaps or touches the newest pending slice is merged
    /// into it. Anything else starts a new pending slice, so older pending
    /// slices never change and commit order is preserved.
    pub fn write(&mut self, pos: u32, data: &[u8]) -> u64 {
        let start = u64::from(pos);
        let end = start + data.len() as u64;

        if let Some(last) = self.pending.last_mut().filter(|last| {
            start <= last.end() && end >= u64::from(last.pos)
        }) {
            let old_len = last.data.len();
            if pos >= last.pos {
                let at = (pos - last.pos) as usize;
                if at + data.len() > last.data.len() {
                    last.data.resize(at + data.len(), 0);
                }
                last.data[at..at + data.len()].copy_from_slice(data);
            } else {
                let new_len = (end.max(last.end()) - start) as usize;
                let mut merged = vec![0u8; new_len];
                let at = (last.pos - pos) as usize;
                merged[at..at + last.data.len()].copy_from_slice(&last.data);
                merged[..data.len()].copy_from_slice(data);
                last.pos = pos;
                last.data = merged;
            }
            return (last.data.len() - old_len) as u64;
        }

        self.pending.push(PendingSlice {
            pos,
            data: data.to_vec(),
        });
        data.len() as u64
    }

    /// Take every pending slice, oldest first
    pub fn take(&mut self) -> Vec<PendingSlice> {
        std::mem::take(&mut self.pending)
    }

    /// Put slices back in front of anything written since they were taken
    pub fn restore(&mut self, mut slices: Vec<PendingSlice>) {
        slices.append(&mut self.pending);
        self.pending = slices;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffered bytes
    pub fn bytes(&self) -> u64 {
        self.pending.iter().map(|p| p.data.len() as u64).sum()
    }

    /// Copies of the pending bytes overlapping `[offset, offset + len)`,
    /// oldest first, as `(chunk offset, bytes)`
    #[must_use]
    pub fn overlapping(&self, offset: u64, len: u64) -> Vec<(u64, Vec<u8>)> {
        let end = offset + len;
        self.pending
            .iter()
            .filter_map(|p| {
                let start = u64::from(p.pos).max(offset);
                let stop = p.end().min(end);
                if start >= stop {
                    return None;
                }
                let from = (start - u64::from(p.pos)) as usize;
                let to = (stop - u64::from(p.pos)) as usize;
                Some((start, p.data[from..to].to_vec()))
            })
            .collect()
    }
}
