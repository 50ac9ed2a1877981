//! Binary form of a [`ChunkMacTable`], stored alongside a paused transfer
//!
//! All integers are little-endian.
//!
//! ```text
//! u16  entry_count
//! u16  format_version
//! entry_count × {
//!     i64  chunk_start
//!     [16] mac
//!     u32  offset      (u32::MAX on the folded prefix entry)
//!     u8   finished    (0 or 1)
//!     [3]  reserved, zero
//! }
//! ```

use std::collections::BTreeMap;

use tracing::warn;

use crate::boundary::ChunkLayout;
use crate::entry::{ChunkMacEntry, EntryState};
use crate::error::{IntegrityError, IntegrityResult};
use crate::table::{ChunkMacTable, FoldPolicy};

pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4;
pub const ENTRY_LEN: usize = 32;

/// Offset value that marks the folded prefix entry.
const PREFIX_SENTINEL: u32 = u32::MAX;

fn malformed(msg: impl Into<String>) -> IntegrityError {
    let msg = msg.into();
    warn!(reason = %msg, "rejecting serialized chunk MAC state");
    IntegrityError::MalformedState(msg)
}

/// Split `N` bytes off the front of `input`.
fn take<'a, const N: usize>(input: &mut &'a [u8]) -> IntegrityResult<[u8; N]> {
    let bytes: &'a [u8] = input;
    let (head, rest) = bytes
        .split_first_chunk::<N>()
        .ok_or_else(|| malformed(format!("truncated: need {N} more bytes, have {}", bytes.len())))?;
    *input = rest;
    Ok(*head)
}

impl ChunkMacTable {
    /// Serialize the table.
    pub fn to_bytes(&self) -> IntegrityResult<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Append the serialized table to `out`. On error `out` is unchanged.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> IntegrityResult<()> {
        let count = u16::try_from(self.entries.len()).map_err(|_| {
            IntegrityError::Unencodable(format!("{} entries exceed the u16 count", self.entries.len()))
        })?;

        let mut buf = Vec::with_capacity(HEADER_LEN + ENTRY_LEN * self.entries.len());
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

        for (&start, entry) in &self.entries {
            let key = i64::try_from(start).map_err(|_| {
                IntegrityError::Unencodable(format!("chunk start {start} exceeds i64"))
            })?;
            let (offset, finished) = match entry.state {
                EntryState::Partial { offset } => {
                    let offset = u32::try_from(offset)
                        .ok()
                        .filter(|&o| o != PREFIX_SENTINEL)
                        .ok_or_else(|| {
                            IntegrityError::Unencodable(format!(
                                "partial offset {offset} of chunk {start} exceeds u32"
                            ))
                        })?;
                    (offset, 0u8)
                }
                EntryState::Finished => (0, 1),
                EntryState::FoldedPrefix => (PREFIX_SENTINEL, 1),
            };

            buf.extend_from_slice(&key.to_le_bytes());
            buf.extend_from_slice(&entry.mac);
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.push(finished);
            buf.extend_from_slice(&[0u8; 3]);
        }

        out.extend_from_slice(&buf);
        Ok(())
    }

    /// Decode a table from the front of `input`, advancing it past the
    /// consumed bytes.
    ///
    /// `contiguous_progress` is restored only up to the folded prefix; call
    /// [`compute_progress`](Self::compute_progress) with the file size afterwards.
    pub fn decode(
        input: &mut &[u8],
        layout: ChunkLayout,
        policy: FoldPolicy,
    ) -> IntegrityResult<Self> {
        let count = u16::from_le_bytes(take::<2>(input)?) as usize;
        let version = u16::from_le_bytes(take::<2>(input)?);
        if version != FORMAT_VERSION {
            return Err(malformed(format!("unsupported format version {version}")));
        }
        if input.len() < count * ENTRY_LEN {
            return Err(malformed(format!(
                "truncated: {count} entries need {} bytes, have {}",
                count * ENTRY_LEN,
                input.len()
            )));
        }

        let mut entries = BTreeMap::new();
        let mut folded_prefix_end = None;
        let mut previous: Option<u64> = None;

        for index in 0..count {
            let key = i64::from_le_bytes(take::<8>(input)?);
            let mac = take::<16>(input)?;
            let offset = u32::from_le_bytes(take::<4>(input)?);
            let finished = take::<1>(input)?[0];
            take::<3>(input)?;

            let start = u64::try_from(key)
                .map_err(|_| malformed(format!("negative chunk start {key}")))?;
            if previous.is_some_and(|prev| start <= prev) {
                return Err(malformed(format!("chunk start {start} is not ascending")));
            }
            previous = Some(start);

            if !layout.is_boundary(start) {
                return Err(malformed(format!("{start} is not a chunk boundary")));
            }

            let state = match (offset, finished) {
                (PREFIX_SENTINEL, 1) => {
                    if index != 0 {
                        return Err(malformed(format!("folded prefix at {start} is not first")));
                    }
                    folded_prefix_end = Some(start);
                    EntryState::FoldedPrefix
                }
                (_, 1) => EntryState::Finished,
                (PREFIX_SENTINEL, 0) => {
                    return Err(malformed(format!("unfinished entry {start} carries the prefix marker")));
                }
                (offset, 0) => {
                    let offset = u64::from(offset);
                    if offset > layout.chunk_end(start, None) - start {
                        return Err(malformed(format!(
                            "partial offset {offset} overruns chunk {start}"
                        )));
                    }
                    EntryState::Partial { offset }
                }
                (_, flag) => return Err(malformed(format!("finished flag {flag} of chunk {start}"))),
            };

            entries.insert(start, ChunkMacEntry { mac, state });
        }

        let contiguous_progress = folded_prefix_end.map_or(0, |end| layout.chunk_end(end, None));

        Ok(Self {
            entries,
            folded_prefix_end,
            contiguous_progress,
            layout,
            policy,
        })
    }

    /// Decode a table that occupies all of `bytes`.
    pub fn from_bytes(bytes: &[u8], layout: ChunkLayout, policy: FoldPolicy) -> IntegrityResult<Self> {
        let mut input = bytes;
        let table = Self::decode(&mut input, layout, policy)?;
        if !input.is_empty() {
            return Err(malformed(format!("{} trailing bytes", input.len())));
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_crypto::{AesChunkCipher, Direction};

    const IV: u64 = 42;

    fn layout() -> ChunkLayout {
        ChunkLayout::new(16)
    }

    fn cipher() -> AesChunkCipher {
        AesChunkCipher::new(&[7u8; 16])
    }

    /// Table with finished, partial and folded entries over a 2000-byte file.
    fn sample_table() -> ChunkMacTable {
        let data: Vec<u8> = (0..2000u32).map(|i| (i * 31) as u8).collect();
        let policy = FoldPolicy {
            margin_bytes: 0,
            min_entries: 6,
        };
        let mut table = ChunkMacTable::with_policy(layout(), policy);
        let spans: Vec<_> = layout().chunks(2000).collect();

        for &(start, end) in &spans[..spans.len() - 1] {
            let mut buf = data[start as usize..end as usize].to_vec();
            table
                .process_chunk(start, &cipher(), &mut buf, start, IV, true, Direction::Encrypt)
                .unwrap();
        }
        let (last, _) = spans[spans.len() - 1];
        let mut buf = data[last as usize..last as usize + 16].to_vec();
        table
            .process_chunk(last, &cipher(), &mut buf, last, IV, false, Direction::Encrypt)
            .unwrap();

        table.compute_progress(2000);
        table.fold_prefix(&cipher());
        table
    }

    fn raw(entries: &[(i64, u32, u8)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        for &(key, offset, finished) in entries {
            out.extend_from_slice(&key.to_le_bytes());
            out.extend_from_slice(&[0xAB; 16]);
            out.extend_from_slice(&offset.to_le_bytes());
            out.push(finished);
            out.extend_from_slice(&[0; 3]);
        }
        out
    }

    fn decode_raw(bytes: &[u8]) -> IntegrityResult<ChunkMacTable> {
        ChunkMacTable::from_bytes(bytes, layout(), FoldPolicy::DEFAULT)
    }

    #[test]
    fn serialized_table_restores_entries_and_prefix() {
        let table = sample_table();
        assert!(table.folded_prefix_end().is_some());

        let bytes = table.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + ENTRY_LEN * table.len());

        let mut restored = ChunkMacTable::from_bytes(&bytes, layout(), table.policy()).unwrap();
        assert_eq!(restored.folded_prefix_end(), table.folded_prefix_end());
        assert!(table.iter().eq(restored.iter()));

        let mut original = table.clone();
        assert_eq!(restored.compute_progress(2000), original.compute_progress(2000));
    }

    #[test]
    fn empty_table_is_header_only() {
        let bytes = ChunkMacTable::with_layout(layout()).to_bytes().unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 0]);
        assert!(decode_raw(&bytes).unwrap().is_empty());
    }

    #[test]
    fn decode_advances_input_past_table() {
        let mut record = sample_table().to_bytes().unwrap();
        let table_len = record.len();
        record.extend_from_slice(b"trailer");

        let mut input = record.as_slice();
        ChunkMacTable::decode(&mut input, layout(), FoldPolicy::DEFAULT).unwrap();
        assert_eq!(input, b"trailer");
        assert_eq!(record.len() - input.len(), table_len);

        assert!(matches!(
            decode_raw(&record),
            Err(IntegrityError::MalformedState(_))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = raw(&[(0, 0, 1), (16, 0, 1)]);
        for len in [0, 3, bytes.len() - 1, HEADER_LEN + ENTRY_LEN] {
            assert!(
                matches!(decode_raw(&bytes[..len]), Err(IntegrityError::MalformedState(_))),
                "length {len} must be rejected"
            );
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = raw(&[]);
        bytes[2] = 2;
        assert!(decode_raw(&bytes).is_err());
    }

    #[test]
    fn rejects_invalid_entries() {
        let cases: &[(&str, Vec<(i64, u32, u8)>)] = &[
            ("negative start", vec![(-16, 0, 1)]),
            ("descending", vec![(16, 0, 1), (0, 0, 1)]),
            ("duplicate", vec![(16, 0, 1), (16, 0, 1)]),
            ("not a boundary", vec![(32, 0, 1)]),
            ("prefix not first", vec![(0, 0, 1), (16, u32::MAX, 1)]),
            ("unfinished prefix marker", vec![(0, u32::MAX, 0)]),
            ("bad finished flag", vec![(0, 0, 2)]),
            ("offset overruns chunk", vec![(16, 33, 0)]),
        ];
        for (name, entries) in cases {
            assert!(
                matches!(decode_raw(&raw(entries)), Err(IntegrityError::MalformedState(_))),
                "{name} must be rejected"
            );
        }
    }

    #[test]
    fn accepts_partial_and_prefix_entries() {
        let table = decode_raw(&raw(&[(16, u32::MAX, 1), (48, 0, 1), (96, 64, 0)])).unwrap();
        assert_eq!(table.folded_prefix_end(), Some(16));
        assert_eq!(table.contiguous_progress(), 48);
        assert_eq!(table.get(48).unwrap().state, EntryState::Finished);
        assert_eq!(table.get(96).unwrap().state, EntryState::Partial { offset: 64 });
    }

    #[test]
    fn too_many_entries_are_unencodable() {
        let mut table = ChunkMacTable::with_layout(ChunkLayout::new(1));
        let mut pos = 0u64;
        for _ in 0..=u16::MAX as usize {
            table.entries.insert(pos, ChunkMacEntry::finished([0; 16]));
            pos = table.layout().chunk_end(pos, None);
        }

        let mut out = vec![9u8];
        assert!(matches!(
            table.encode_into(&mut out),
            Err(IntegrityError::Unencodable(_))
        ));
        assert_eq!(out, vec![9u8], "output untouched on error");
    }
}
