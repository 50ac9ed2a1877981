use serde::{Deserialize, Serialize};

/// Progress summary of a transfer, derived from its chunk MAC table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Largest offset below which every chunk is finished
    pub contiguous: u64,
    /// Bytes accounted for: finished chunks plus partial chunk offsets
    pub completed: u64,
    /// Sum of the partial offsets of unfinished chunks
    pub partial_bytes: u64,
}

impl TransferProgress {
    /// True once every byte of a `file_size`-byte file is finished.
    pub fn is_complete(&self, file_size: u64) -> bool {
        self.contiguous >= file_size
    }
}

