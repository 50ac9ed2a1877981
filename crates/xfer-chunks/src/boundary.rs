//! Progressive chunk layout
//!
//! Chunk `k` (1-based) has size `k * S` for `k <= 8`; every later chunk is `8 * S`.
//! Small files therefore need few bytes per round trip while large files reach
//! the steady chunk size after `36 * S` bytes.
//!
//! With `S = 1` the boundaries are `0, 1, 3, 6, 10, 15, 21, 28, 36, 44, 52, …`.

use xfer_core::config::IntegrityConfig;
use xfer_crypto::BLOCK_SIZE;

/// Default segment unit (128 KiB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 128 * 1024;

/// Number of growing chunks before the layout reaches its steady size
const PROGRESSIVE_STEPS: u64 = 8;

/// Chunk boundaries for a given segment unit.
///
/// Boundaries are pure arithmetic and any non-zero unit works here. A
/// [`ChunkMacTable`](crate::ChunkMacTable) only accepts writes starting on a
/// 16-byte cipher block, so a layout used for MAC tracking needs a segment
/// unit that is a multiple of 16 (see [`is_block_aligned`](Self::is_block_aligned)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    segment_size: u64,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl ChunkLayout {
    pub const DEFAULT: ChunkLayout = ChunkLayout {
        segment_size: DEFAULT_SEGMENT_SIZE,
    };

    pub const fn new(segment_size: u64) -> Self {
        assert!(segment_size > 0, "segment size must be non-zero");
        Self { segment_size }
    }

    /// True if every chunk boundary falls on a cipher block.
    pub const fn is_block_aligned(&self) -> bool {
        self.segment_size % BLOCK_SIZE as u64 == 0
    }

    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self::new(config.segment_size)
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Size of every chunk after the progressive ones.
    pub fn steady_chunk_size(&self) -> u64 {
        PROGRESSIVE_STEPS * self.segment_size
    }

    /// Start and (unclamped) end of the chunk containing `pos`.
    fn bounds(&self, pos: u64) -> (u64, u64) {
        let mut start = 0u64;
        for step in 1..=PROGRESSIVE_STEPS {
            let end = start + step * self.segment_size;
            if pos < end {
                return (start, end);
            }
            start = end;
        }

        let steady = self.steady_chunk_size();
        let start = start + (pos - start) / steady * steady;
        (start, start.saturating_add(steady))
    }

    /// Offset of the chunk containing byte `pos`.
    pub fn chunk_start(&self, pos: u64) -> u64 {
        self.bounds(pos).0
    }

    /// Offset immediately after the chunk containing `pos`, clamped to `limit`.
    pub fn chunk_end(&self, pos: u64, limit: Option<u64>) -> u64 {
        let end = self.bounds(pos).1;
        limit.map_or(end, |limit| end.min(limit))
    }

    /// Zero-based ordinal of the chunk containing `pos`.
    pub fn chunk_index(&self, pos: u64) -> u64 {
        let mut start = 0u64;
        for step in 1..=PROGRESSIVE_STEPS {
            start += step * self.segment_size;
            if pos < start {
                return step - 1;
            }
        }
        PROGRESSIVE_STEPS + (pos - start) / self.steady_chunk_size()
    }

    /// True if `pos` is the first byte of a chunk.
    pub fn is_boundary(&self, pos: u64) -> bool {
        self.chunk_start(pos) == pos
    }

    /// Iterate `(start, end)` spans of every chunk of a `file_size`-byte file.
    pub fn chunks(&self, file_size: u64) -> ChunkSpans {
        ChunkSpans {
            layout: *self,
            pos: 0,
            file_size,
        }
    }
}

/// Iterator over the chunk spans of a file, see [`ChunkLayout::chunks`].
#[derive(Debug, Clone)]
pub struct ChunkSpans {
    layout: ChunkLayout,
    pos: u64,
    file_size: u64,
}

impl Iterator for ChunkSpans {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.file_size {
            return None;
        }
        let start = self.pos;
        let end = self.layout.chunk_end(start, Some(self.file_size));
        self.pos = end;
        Some((start, end))
    }
}
