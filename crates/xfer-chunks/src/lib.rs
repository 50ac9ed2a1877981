//! xfer-chunks: integrity bookkeeping for encrypted, resumable, multi-connection transfers
//!
//! # Overview
//! - `boundary`: progressive chunk layout (`S, 2S, … 8S`, then `8S` forever)
//! - `entry`: one chunk's MAC accumulator and progress state
//! - `table`: ordered chunk MAC table with the cipher step, progress queries and prefix folding
//! - `codec`: little-endian binary form of a table (`to_bytes` / `decode`) for resuming transfers
//! - `reducer`: folds chunk MACs into the 64-bit file tag
//! - `verify`: recomputes the tag of local plaintext and checks it
//!
//! The engine is synchronous and single-writer: callers serialize access to a
//! table and own any retry policy.

pub mod boundary;
pub mod codec;
pub mod entry;
pub mod error;
pub mod reducer;
pub mod table;
pub mod verify;

// Convenience re-exports for the most common operations
pub use boundary::{ChunkLayout, ChunkSpans};
pub use entry::{ChunkMacEntry, EntryState};
pub use error::{IntegrityError, IntegrityResult};
pub use reducer::{
    recover_missing_late_entries, reduce_all, reduce_with_exclusions, ExclusionRanges,
    GapRecovery,
};
pub use table::{ChunkMacTable, FoldPolicy};
pub use verify::{ensure_tag, IntegrityVerifier};
