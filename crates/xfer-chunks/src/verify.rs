//! Local file tag computation and verification
//!
//! Recomputes the chunk MACs of plaintext held locally (a finished download,
//! or a file about to be uploaded) on a fresh table and folds them into the
//! file tag. Tables are folded as they fill, so memory stays bounded however
//! large the input.

use std::io::Read;

use rayon::prelude::*;
use tracing::{debug, instrument, warn};
use xfer_core::config::{GapSearchConfig, IntegrityConfig};
use xfer_crypto::{ChunkCipher, Direction, FileTag};

use crate::boundary::ChunkLayout;
use crate::error::{IntegrityError, IntegrityResult};
use crate::reducer::{recover_missing_late_entries, reduce_all};
use crate::table::{ChunkMacTable, FoldPolicy};

/// Chunks handed to one rayon task by [`IntegrityVerifier::file_tag_parallel`].
const PARALLEL_BATCH: usize = 64;

/// Computes and checks file tags with a fixed layout and fold policy.
#[derive(Debug, Clone, Default)]
pub struct IntegrityVerifier {
    layout: ChunkLayout,
    policy: FoldPolicy,
    gap_search: GapSearchConfig,
}

impl IntegrityVerifier {
    pub fn new(layout: ChunkLayout) -> Self {
        Self::with_policy(layout, FoldPolicy::DEFAULT)
    }

    pub fn with_policy(layout: ChunkLayout, policy: FoldPolicy) -> Self {
        Self {
            layout,
            policy,
            gap_search: GapSearchConfig::default(),
        }
    }

    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self {
            layout: ChunkLayout::from_config(config),
            policy: FoldPolicy::from_config(config),
            gap_search: config.gap_search.clone(),
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Fresh table for this verifier; fails if the layout's chunks would not
    /// start on cipher blocks.
    fn new_table(&self) -> IntegrityResult<ChunkMacTable> {
        if !self.layout.is_block_aligned() {
            return Err(IntegrityError::OutOfRange(format!(
                "segment size {} is not a multiple of the cipher block",
                self.layout.segment_size()
            )));
        }
        Ok(ChunkMacTable::with_policy(self.layout, self.policy))
    }

    /// Tag of `plaintext` encrypted with `cipher` under `ctr_iv`.
    #[instrument(skip_all, fields(len = plaintext.len()))]
    pub fn file_tag<C: ChunkCipher + ?Sized>(
        &self,
        cipher: &C,
        plaintext: &[u8],
        ctr_iv: u64,
    ) -> IntegrityResult<FileTag> {
        let size = plaintext.len() as u64;
        let mut table = self.new_table()?;
        let mut scratch = Vec::new();

        for (start, end) in self.layout.chunks(size) {
            scratch.clear();
            scratch.extend_from_slice(&plaintext[start as usize..end as usize]);
            table.process_chunk(
                start,
                cipher,
                &mut scratch,
                start,
                ctr_iv,
                true,
                Direction::Encrypt,
            )?;
            table.update_contiguous_progress(size);
            table.fold_prefix(cipher);
        }

        Ok(reduce_all(&table, cipher))
    }

    /// True if `plaintext` authenticates against `expected`.
    pub fn verify<C: ChunkCipher + ?Sized>(
        &self,
        expected: &FileTag,
        cipher: &C,
        plaintext: &[u8],
        ctr_iv: u64,
    ) -> bool {
        match self.file_tag(cipher, plaintext, ctr_iv) {
            Ok(computed) if computed.ct_matches(expected) => true,
            Ok(computed) => {
                warn!(%expected, %computed, "file tag mismatch");
                false
            }
            Err(e) => {
                warn!(error = %e, "file tag could not be computed");
                false
            }
        }
    }

    /// Build the chunk MAC table of the next `len` bytes of `reader`.
    #[instrument(skip_all, fields(len = len))]
    pub fn table_from_reader<C: ChunkCipher + ?Sized, R: Read>(
        &self,
        cipher: &C,
        mut reader: R,
        len: u64,
        ctr_iv: u64,
    ) -> IntegrityResult<ChunkMacTable> {
        let mut table = self.new_table()?;
        let mut buf = Vec::with_capacity(self.layout.steady_chunk_size() as usize);

        for (start, end) in self.layout.chunks(len) {
            buf.resize((end - start) as usize, 0);
            reader.read_exact(&mut buf)?;
            table.process_chunk(start, cipher, &mut buf, start, ctr_iv, true, Direction::Encrypt)?;
            table.update_contiguous_progress(len);
            table.fold_prefix(cipher);
        }

        debug!(entries = table.len(), folded_prefix_end = ?table.folded_prefix_end(), "table built");
        Ok(table)
    }

    /// Tag of the next `len` bytes of `reader`.
    pub fn file_tag_from_reader<C: ChunkCipher + ?Sized, R: Read>(
        &self,
        cipher: &C,
        reader: R,
        len: u64,
        ctr_iv: u64,
    ) -> IntegrityResult<FileTag> {
        let table = self.table_from_reader(cipher, reader, len, ctr_iv)?;
        Ok(reduce_all(&table, cipher))
    }

    /// True if the next `len` bytes of `reader` authenticate against `expected`.
    pub fn verify_reader<C: ChunkCipher + ?Sized, R: Read>(
        &self,
        expected: &FileTag,
        cipher: &C,
        reader: R,
        len: u64,
        ctr_iv: u64,
    ) -> IntegrityResult<bool> {
        let computed = self.file_tag_from_reader(cipher, reader, len, ctr_iv)?;
        Ok(computed.ct_matches(expected))
    }

    /// Check a completed table against `expected`, accepting tags that left
    /// out late chunk MACs. Returns the tag the file should carry.
    pub fn check_table<C: ChunkCipher + ?Sized>(
        &self,
        table: &ChunkMacTable,
        cipher: &C,
        expected: &FileTag,
    ) -> IntegrityResult<FileTag> {
        let computed = reduce_all(table, cipher);
        if computed.ct_matches(expected) {
            return Ok(computed);
        }

        match recover_missing_late_entries(table, cipher, expected, &self.gap_search) {
            Some(recovery) => Ok(recovery.corrected),
            None => {
                warn!(%expected, %computed, entries = table.len(), "file tag mismatch");
                table.log_entries();
                Err(IntegrityError::TagMismatch {
                    expected: *expected,
                    computed,
                })
            }
        }
    }

    /// Same tag as [`file_tag`](Self::file_tag), with chunk MACs computed on
    /// the rayon pool. Each task fills its own table; the parts are merged in
    /// offset order and folded as they arrive.
    #[instrument(skip_all, fields(len = plaintext.len()))]
    pub fn file_tag_parallel<C: ChunkCipher + Sync + ?Sized>(
        &self,
        cipher: &C,
        plaintext: &[u8],
        ctr_iv: u64,
    ) -> IntegrityResult<FileTag> {
        let size = plaintext.len() as u64;
        let mut merged = self.new_table()?;
        let spans: Vec<(u64, u64)> = self.layout.chunks(size).collect();

        let parts: Vec<IntegrityResult<ChunkMacTable>> = spans
            .par_chunks(PARALLEL_BATCH)
            .map(|batch| {
                let mut part = self.new_table()?;
                let mut scratch = Vec::new();
                for &(start, end) in batch {
                    scratch.clear();
                    scratch.extend_from_slice(&plaintext[start as usize..end as usize]);
                    part.process_chunk(
                        start,
                        cipher,
                        &mut scratch,
                        start,
                        ctr_iv,
                        true,
                        Direction::Encrypt,
                    )?;
                }
                Ok(part)
            })
            .collect();

        for part in parts {
            part?.copy_entries_to(&mut merged)?;
            merged.update_contiguous_progress(size);
            merged.fold_prefix(cipher);
        }

        Ok(reduce_all(&merged, cipher))
    }
}

/// Turn a tag comparison into a result.
pub fn ensure_tag(expected: &FileTag, computed: &FileTag) -> IntegrityResult<()> {
    if computed.ct_matches(expected) {
        Ok(())
    } else {
        Err(IntegrityError::TagMismatch {
            expected: *expected,
            computed: *computed,
        })
    }
}
