//! Fold chunk MACs into the 64-bit file tag
//!
//! The accumulator starts at zero (or at the folded prefix), and every chunk
//! MAC in ascending offset order is XORed in and block-encrypted. The
//! resulting 16-byte block is condensed to 8 bytes:
//!
//! ```text
//! tag[0..4] = acc[0..4] ^ acc[4..8]
//! tag[4..8] = acc[8..12] ^ acc[12..16]
//! ```
//!
//! The fold is order-sensitive over offsets but not over completion order: a
//! table holding the same entries yields the same tag however it was filled.

use std::ops::Range;

use tracing::{debug, warn};
use xfer_core::config::GapSearchConfig;
use xfer_crypto::{xor_block, ChunkCipher, FileTag, MacBlock, TAG_SIZE};

use crate::table::ChunkMacTable;

/// Up to two half-open ranges of chunk ordinals left out of a fold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionRanges {
    pub first: Range<usize>,
    pub second: Range<usize>,
}

impl ExclusionRanges {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn single(range: Range<usize>) -> Self {
        Self {
            first: range,
            second: 0..0,
        }
    }

    pub fn pair(first: Range<usize>, second: Range<usize>) -> Self {
        Self { first, second }
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        self.first.contains(&ordinal) || self.second.contains(&ordinal)
    }
}

/// Condense a 16-byte accumulator into the file tag.
pub fn condense(acc: &MacBlock) -> FileTag {
    let mut tag = [0u8; TAG_SIZE];
    for i in 0..4 {
        tag[i] = acc[i] ^ acc[i + 4];
        tag[i + 4] = acc[i + 8] ^ acc[i + 12];
    }
    FileTag::from_bytes(tag)
}

/// File tag over every entry of `table`.
pub fn reduce_all<C: ChunkCipher + ?Sized>(table: &ChunkMacTable, cipher: &C) -> FileTag {
    reduce_with_exclusions(table, cipher, &ExclusionRanges::none())
}

/// File tag over the entries of `table` whose ordinal is not excluded.
///
/// Ordinals count chunks from the start of the file: the folded prefix covers
/// every chunk up to and including its key, each later entry counts as one.
/// The folded prefix itself is never excluded.
pub fn reduce_with_exclusions<C: ChunkCipher + ?Sized>(
    table: &ChunkMacTable,
    cipher: &C,
    exclusions: &ExclusionRanges,
) -> FileTag {
    let mut acc: MacBlock = [0u8; 16];
    let mut ordinal = 0usize;

    for (start, entry) in table.iter() {
        if entry.is_folded_prefix() {
            acc = entry.mac;
            ordinal += prefix_ordinals(table, start);
            continue;
        }
        if !exclusions.contains(ordinal) {
            xor_block(&entry.mac, &mut acc);
            cipher.encrypt_block(&mut acc);
        }
        ordinal += 1;
    }

    condense(&acc)
}

fn prefix_ordinals(table: &ChunkMacTable, prefix_key: u64) -> usize {
    usize::try_from(table.layout().chunk_index(prefix_key)).map_or(usize::MAX, |i| i + 1)
}

/// Number of chunk ordinals a fold over `table` walks.
pub fn ordinal_count(table: &ChunkMacTable) -> usize {
    table.iter().fold(0usize, |count, (start, entry)| {
        if entry.is_folded_prefix() {
            count.saturating_add(prefix_ordinals(table, start))
        } else {
            count.saturating_add(1)
        }
    })
}

/// Result of a successful late-gap search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRecovery {
    /// Ordinals whose exclusion reproduced the expected tag.
    pub gaps: ExclusionRanges,
    /// Tag over every entry, which the file should have carried.
    pub corrected: FileTag,
}

/// Search for chunks near the end of the file whose omission explains a tag
/// mismatch.
///
/// Some writers computed the file tag before their last connections reported
/// back, leaving out the MACs of data that nevertheless reached storage. The
/// search first tries one gap ending within the last `single_window` chunks,
/// then two separated gaps starting within the last `pair_window` chunks.
/// Returns `None` if no such gap reproduces `expected`.
pub fn recover_missing_late_entries<C: ChunkCipher + ?Sized>(
    table: &ChunkMacTable,
    cipher: &C,
    expected: &FileTag,
    search: &GapSearchConfig,
) -> Option<GapRecovery> {
    let end = ordinal_count(table);
    let matches =
        |gaps: &ExclusionRanges| reduce_with_exclusions(table, cipher, gaps).ct_matches(expected);

    let single_window = search.single_window.min(end);
    for count_back in 1..=single_window {
        let start1 = end - count_back;
        for len1 in (1..=search.single_max_len).take_while(|&len| start1 + len <= end) {
            let gaps = ExclusionRanges::single(start1..start1 + len1);
            if matches(&gaps) {
                return Some(found(table, cipher, gaps, end));
            }
        }
    }

    let pair_window = search.pair_window.min(end);
    for start1 in end - pair_window..end {
        for len1 in (1..=search.pair_max_len).take_while(|&len| start1 + len <= end) {
            for start2 in start1 + len1 + 1..end {
                for len2 in (1..=search.pair_max_len).take_while(|&len| start2 + len <= end) {
                    let gaps = ExclusionRanges::pair(start1..start1 + len1, start2..start2 + len2);
                    if matches(&gaps) {
                        return Some(found(table, cipher, gaps, end));
                    }
                }
            }
        }
    }

    debug!(ordinals = end, "no late gap explains the file tag");
    None
}

fn found<C: ChunkCipher + ?Sized>(
    table: &ChunkMacTable,
    cipher: &C,
    gaps: ExclusionRanges,
    end: usize,
) -> GapRecovery {
    let corrected = reduce_all(table, cipher);
    warn!(
        first = ?gaps.first,
        second = ?gaps.second,
        ordinals = end,
        %corrected,
        "file tag omitted late chunk MACs; accepting corrected tag"
    );
    GapRecovery { gaps, corrected }
}
