//! Ordered chunk MAC table
//!
//! Maps chunk start offsets to [`ChunkMacEntry`] values for one transfer
//! attempt. Chunks may complete in any order; the table tracks the
//! contiguous-from-start progress and, once that progress is far enough
//! ahead, folds the oldest finished chunks into a single prefix entry so that
//! memory stays bounded for very large files.
//!
//! Invariants:
//! - at most one [`EntryState::FoldedPrefix`] entry exists; it is the first
//!   entry and its key equals `folded_prefix_end`
//! - every other key is a chunk boundary strictly after `folded_prefix_end`

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, trace, warn};
use xfer_core::config::IntegrityConfig;
use xfer_core::types::TransferProgress;
use xfer_crypto::{xor_block, ChunkCipher, Direction, BLOCK_SIZE};

use crate::boundary::ChunkLayout;
use crate::entry::{ChunkMacEntry, EntryState};
use crate::error::{IntegrityError, IntegrityResult};

/// When the prefix of a table may be folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldPolicy {
    /// The fold frontier must stay this many bytes behind contiguous progress.
    pub margin_bytes: u64,
    /// Folding stops once the table holds this many entries, leaving room for
    /// the late-entry tag recovery to exclude recent chunks.
    pub min_entries: usize,
}

impl FoldPolicy {
    pub const DEFAULT: FoldPolicy = FoldPolicy {
        margin_bytes: 5 * 1024 * 1024,
        min_entries: 32 * 3 + 5,
    };

    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self {
            margin_bytes: config.fold_margin_bytes,
            min_entries: config.fold_min_entries,
        }
    }
}

impl Default for FoldPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-transfer chunk MAC state.
#[derive(Debug, Clone, Default)]
pub struct ChunkMacTable {
    pub(crate) entries: BTreeMap<u64, ChunkMacEntry>,
    pub(crate) folded_prefix_end: Option<u64>,
    pub(crate) contiguous_progress: u64,
    pub(crate) layout: ChunkLayout,
    pub(crate) policy: FoldPolicy,
}

impl ChunkMacTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(layout: ChunkLayout) -> Self {
        Self::with_policy(layout, FoldPolicy::DEFAULT)
    }

    pub fn with_policy(layout: ChunkLayout, policy: FoldPolicy) -> Self {
        Self {
            layout,
            policy,
            ..Self::default()
        }
    }

    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self::with_policy(
            ChunkLayout::from_config(config),
            FoldPolicy::from_config(config),
        )
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn policy(&self) -> FoldPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, chunk_start: u64) -> Option<&ChunkMacEntry> {
        self.entries.get(&chunk_start)
    }

    /// Entries in ascending chunk order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &ChunkMacEntry)> + '_ {
        self.entries.iter().map(|(&start, entry)| (start, entry))
    }

    /// Start offset of the last chunk absorbed into the folded prefix.
    pub fn folded_prefix_end(&self) -> Option<u64> {
        self.folded_prefix_end
    }

    /// Last value computed by [`compute_progress`](Self::compute_progress) or
    /// [`update_contiguous_progress`](Self::update_contiguous_progress).
    pub fn contiguous_progress(&self) -> u64 {
        self.contiguous_progress
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.folded_prefix_end = None;
        self.contiguous_progress = 0;
    }

    /// True if `pos` lies inside the folded prefix.
    fn is_folded(&self, pos: u64) -> bool {
        self.folded_prefix_end
            .is_some_and(|end| pos < self.layout.chunk_end(end, None))
    }

    fn ensure_unfolded(&self, pos: u64, what: &str) -> IntegrityResult<()> {
        if self.is_folded(pos) {
            return Err(IntegrityError::OutOfRange(format!(
                "{what} at {pos} addresses folded history (prefix folded through chunk {})",
                self.folded_prefix_end.unwrap_or_default()
            )));
        }
        Ok(())
    }

    // ── Cipher step ──────────────────────────────────────────────────────────

    /// Encrypt or decrypt `buffer` in place as the bytes at `stream_offset`
    /// of the chunk starting at `chunk_start`, advancing that chunk's MAC.
    ///
    /// A write starting at the chunk start seeds the MAC; any other write must
    /// continue exactly where the previous one stopped. `final_write` marks
    /// the chunk finished, otherwise its partial offset advances. Only a final
    /// write may end inside a cipher block.
    ///
    /// Precondition violations return [`IntegrityError::OutOfRange`] and leave
    /// both the table and the buffer untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn process_chunk<C: ChunkCipher + ?Sized>(
        &mut self,
        chunk_start: u64,
        cipher: &C,
        buffer: &mut [u8],
        stream_offset: u64,
        ctr_iv: u64,
        final_write: bool,
        direction: Direction,
    ) -> IntegrityResult<()> {
        self.ensure_unfolded(chunk_start, "chunk write")?;

        if !self.layout.is_boundary(chunk_start) {
            return Err(IntegrityError::OutOfRange(format!(
                "{chunk_start} is not a chunk boundary"
            )));
        }

        let chunk_end = self.layout.chunk_end(chunk_start, None);
        let write_end = stream_offset
            .checked_add(buffer.len() as u64)
            .ok_or_else(|| IntegrityError::OutOfRange("write end overflows".into()))?;

        if stream_offset < chunk_start || write_end > chunk_end {
            return Err(IntegrityError::OutOfRange(format!(
                "write [{stream_offset}, {write_end}) outside chunk [{chunk_start}, {chunk_end})"
            )));
        }
        if stream_offset % BLOCK_SIZE as u64 != 0 {
            return Err(IntegrityError::OutOfRange(format!(
                "write at {stream_offset} is not aligned to the {BLOCK_SIZE}-byte cipher block"
            )));
        }
        if !final_write && buffer.len() % BLOCK_SIZE != 0 {
            return Err(IntegrityError::OutOfRange(format!(
                "non-final write of {} bytes is not a multiple of the {BLOCK_SIZE}-byte cipher block",
                buffer.len()
            )));
        }

        let seed = stream_offset == chunk_start;
        let mut entry = self.entries.get(&chunk_start).copied().unwrap_or_default();

        if !seed {
            match entry.state {
                EntryState::Partial { offset } if chunk_start + offset == stream_offset => {}
                EntryState::Partial { offset } => {
                    return Err(IntegrityError::OutOfRange(format!(
                        "write at {stream_offset} does not continue chunk {chunk_start} \
                         (processed through {})",
                        chunk_start + offset
                    )));
                }
                EntryState::Finished | EntryState::FoldedPrefix => {
                    return Err(IntegrityError::OutOfRange(format!(
                        "chunk {chunk_start} is finished; its MAC cannot be advanced"
                    )));
                }
            }
        }

        if !final_write && direction == Direction::Decrypt && write_end == chunk_end {
            return Err(IntegrityError::OutOfRange(format!(
                "non-final write reaches the end of chunk {chunk_start}"
            )));
        }

        cipher.ctr_crypt(buffer, stream_offset, ctr_iv, &mut entry.mac, direction, seed);

        entry.state = if final_write {
            EntryState::Finished
        } else {
            EntryState::Partial {
                offset: write_end - chunk_start,
            }
        };
        self.entries.insert(chunk_start, entry);

        trace!(
            chunk_start,
            stream_offset,
            len = buffer.len(),
            final_write,
            ?direction,
            "chunk MAC advanced"
        );
        Ok(())
    }

    // ── Progress ─────────────────────────────────────────────────────────────

    /// Scan the table for contiguous and total progress of a `file_size`-byte
    /// file, recording the contiguous offset.
    pub fn compute_progress(&mut self, file_size: u64) -> TransferProgress {
        let mut progress = TransferProgress::default();

        for (&start, entry) in &self.entries {
            let end = self.layout.chunk_end(start, Some(file_size));
            match entry.state {
                EntryState::FoldedPrefix => {
                    progress.contiguous = end;
                    progress.completed = end;
                }
                EntryState::Finished => {
                    if progress.contiguous == start {
                        progress.contiguous = end;
                    }
                    progress.completed += end.saturating_sub(start);
                }
                EntryState::Partial { offset } => {
                    progress.completed += offset;
                    progress.partial_bytes += offset;
                }
            }
        }

        self.contiguous_progress = progress.contiguous;
        progress
    }

    /// Advance the contiguous offset over chunks finished since it was last computed.
    pub fn update_contiguous_progress(&mut self, file_size: u64) -> u64 {
        while self.contiguous_progress < file_size && self.finished_at(self.contiguous_progress) {
            self.contiguous_progress = self
                .layout
                .chunk_end(self.contiguous_progress, Some(file_size));
        }
        self.contiguous_progress
    }

    /// True if the chunk starting at `pos` is finished (or already folded).
    pub fn finished_at(&self, pos: u64) -> bool {
        self.is_folded(pos) || self.entries.get(&pos).is_some_and(ChunkMacEntry::is_finished)
    }

    /// True if some unfinished or missing chunk precedes a later finished one,
    /// i.e. chunks completed out of order.
    pub fn has_unfinished_gap(&self, file_size: u64) -> bool {
        let mut expected = 0u64;
        let mut saw_unfinished = false;

        for (&start, entry) in &self.entries {
            if entry.is_folded_prefix() {
                expected = self.layout.chunk_end(start, Some(file_size));
                continue;
            }
            if start != expected {
                saw_unfinished = true;
            }
            if entry.is_finished() {
                if saw_unfinished {
                    return true;
                }
            } else {
                saw_unfinished = true;
            }
            expected = self.layout.chunk_end(start, Some(file_size));
        }
        false
    }

    /// First offset at or after `pos` whose bytes have not been processed.
    pub fn next_unprocessed_offset(&self, pos: u64) -> u64 {
        let mut pos = pos;
        if let Some(end) = self.folded_prefix_end {
            pos = pos.max(self.layout.chunk_end(end, None));
        }

        loop {
            let start = self.layout.chunk_start(pos);
            match self.entries.get(&start) {
                Some(entry) if entry.is_finished() => pos = self.layout.chunk_end(pos, None),
                Some(entry) => return pos.max(start + entry.offset()),
                None => return pos,
            }
        }
    }

    /// Extend a request `[pos, candidate_end)` chunk by chunk while the next
    /// chunk is untouched and the span stays below `max_span`.
    pub fn expand_unprocessed_range(
        &self,
        pos: u64,
        candidate_end: u64,
        file_size: u64,
        max_span: u64,
    ) -> u64 {
        let mut end = candidate_end;
        while end < file_size
            && end.saturating_sub(pos) < max_span
            && !self.is_folded(end)
            && self.entries.get(&end).is_none_or(ChunkMacEntry::not_started)
        {
            end = self.layout.chunk_end(end, Some(file_size));
        }
        end
    }

    // ── Prefix folding ───────────────────────────────────────────────────────

    /// Fold finished chunks at the start of the table into the prefix entry
    /// while the fold policy allows. Returns the number of chunks folded.
    ///
    /// Uses the contiguous progress last computed; call
    /// [`compute_progress`](Self::compute_progress) or
    /// [`update_contiguous_progress`](Self::update_contiguous_progress) first.
    pub fn fold_prefix<C: ChunkCipher + ?Sized>(&mut self, cipher: &C) -> usize {
        let mut folded = 0usize;

        while self
            .contiguous_progress
            .saturating_sub(self.folded_prefix_end.unwrap_or(0))
            > self.policy.margin_bytes
            && self.entries.len() > self.policy.min_entries
        {
            let Some((&first_key, &first)) = self.entries.first_key_value() else {
                break;
            };

            if first.is_folded_prefix() {
                let next_key = self.layout.chunk_end(first_key, None);
                let Some(next) = self.entries.get_mut(&next_key) else {
                    warn!(next_key, "no entry follows the folded prefix; fold stopped");
                    break;
                };
                if next.state != EntryState::Finished {
                    warn!(next_key, state = ?next.state, "chunk after the folded prefix is unfinished; fold stopped");
                    break;
                }

                xor_block(&first.mac, &mut next.mac);
                cipher.encrypt_block(&mut next.mac);
                next.state = EntryState::FoldedPrefix;

                self.entries.remove(&first_key);
                self.folded_prefix_end = Some(next_key);
            } else if first_key == 0 && first.state == EntryState::Finished {
                if let Some(entry) = self.entries.get_mut(&0) {
                    // zero accumulator: E(0 ^ mac) = E(mac)
                    cipher.encrypt_block(&mut entry.mac);
                    entry.state = EntryState::FoldedPrefix;
                }
                self.folded_prefix_end = Some(0);
            } else {
                break;
            }
            folded += 1;
        }

        if folded > 0 {
            debug!(
                folded,
                folded_prefix_end = ?self.folded_prefix_end,
                remaining = self.entries.len(),
                "chunk MAC prefix folded"
            );
        }
        folded
    }

    // ── Hand-off between tables ──────────────────────────────────────────────

    /// Record every entry of `confirmed` as finished in this table (upload
    /// chunks acknowledged by the server).
    pub fn merge_finished_from(&mut self, confirmed: &ChunkMacTable) -> IntegrityResult<()> {
        for (&start, entry) in &confirmed.entries {
            if entry.is_folded_prefix() {
                return Err(IntegrityError::OutOfRange(format!(
                    "cannot merge folded prefix at {start}"
                )));
            }
            self.ensure_unfolded(start, "merge")?;
        }

        for (&start, entry) in &confirmed.entries {
            self.entries.insert(start, ChunkMacEntry::finished(entry.mac));
            debug!(chunk_start = start, "upload chunk completed");
        }
        Ok(())
    }

    /// Copy every entry into `dest` unchanged. This table must not have a
    /// folded prefix.
    pub fn copy_entries_to(&self, dest: &mut ChunkMacTable) -> IntegrityResult<()> {
        if let Some(end) = self.folded_prefix_end {
            return Err(IntegrityError::OutOfRange(format!(
                "cannot copy entries of a table folded through {end}"
            )));
        }
        for &start in self.entries.keys() {
            dest.ensure_unfolded(start, "copy")?;
        }

        dest.entries
            .extend(self.entries.iter().map(|(&start, entry)| (start, *entry)));
        Ok(())
    }

    /// Replace this table's entry at `pos` with `source`'s (a fresh entry if
    /// `source` has none).
    pub fn adopt_entry_from(&mut self, pos: u64, source: &ChunkMacTable) -> IntegrityResult<()> {
        self.ensure_unfolded(pos, "adopt")?;

        let entry = source.entries.get(&pos).copied().unwrap_or_default();
        if entry.is_folded_prefix() {
            return Err(IntegrityError::OutOfRange(format!(
                "cannot adopt folded prefix at {pos}"
            )));
        }
        self.entries.insert(pos, entry);
        Ok(())
    }

    /// Copy finished entries into `dest` up to the largest chunk boundary
    /// `<= max_offset` that is a multiple of `alignment_unit`. Returns that
    /// aligned offset (0 if none).
    ///
    /// Copying stops at the first unfinished entry, so `dest` may cover less
    /// than the returned offset; resume from `dest.next_unprocessed_offset(0)`.
    /// A folded prefix is carried over only into an empty `dest`.
    pub fn copy_finished_prefix_until_aligned(
        &self,
        max_offset: u64,
        dest: &mut ChunkMacTable,
        alignment_unit: u64,
    ) -> u64 {
        if alignment_unit == 0 {
            return 0;
        }

        let mut max_pos = self.layout.chunk_start(max_offset);
        while max_pos > 0 && max_pos % alignment_unit != 0 {
            trace!(max_pos, alignment_unit, "offset not on an alignment line");
            max_pos -= max_pos % alignment_unit;
            max_pos = self.layout.chunk_start(max_pos);
        }
        debug!(max_pos, "aligned hand-off offset");

        if max_pos == 0 {
            return 0;
        }

        for (&start, entry) in &self.entries {
            if start >= max_pos {
                break;
            }
            if entry.is_folded_prefix() && dest.is_empty() {
                dest.entries.insert(start, *entry);
                dest.folded_prefix_end = Some(start);
                dest.contiguous_progress = self.layout.chunk_end(start, None);
                continue;
            }
            if entry.state != EntryState::Finished {
                debug!(chunk_start = start, state = ?entry.state, "hand-off stopped at unfinished chunk");
                break;
            }
            if dest.is_folded(start) {
                debug!(chunk_start = start, "hand-off stopped at destination's folded prefix");
                break;
            }
            dest.entries.insert(start, *entry);
        }

        max_pos
    }

    /// Dump every entry at debug level.
    pub fn log_entries(&self) {
        for (&start, entry) in &self.entries {
            debug!(
                chunk_start = start,
                mac = %STANDARD.encode(entry.mac),
                state = ?entry.state,
                "chunk MAC entry"
            );
        }
    }
}
