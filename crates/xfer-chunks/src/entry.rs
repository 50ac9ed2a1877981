use xfer_crypto::MacBlock;

/// Progress of one table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// `offset` bytes from the chunk start have been folded into the MAC.
    Partial { offset: u64 },
    /// The whole chunk has been processed.
    Finished,
    /// Not a real chunk: the running fold of every chunk MAC up to and
    /// including the chunk at this entry's key.
    FoldedPrefix,
}

/// MAC accumulator and progress of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMacEntry {
    pub mac: MacBlock,
    pub state: EntryState,
}

impl Default for ChunkMacEntry {
    fn default() -> Self {
        Self {
            mac: [0u8; 16],
            state: EntryState::Partial { offset: 0 },
        }
    }
}

impl ChunkMacEntry {
    pub fn finished(mac: MacBlock) -> Self {
        Self {
            mac,
            state: EntryState::Finished,
        }
    }

    pub fn not_started(&self) -> bool {
        self.state == EntryState::Partial { offset: 0 }
    }

    /// Fully processed: a finished chunk or the folded prefix.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, EntryState::Finished | EntryState::FoldedPrefix)
    }

    pub fn is_folded_prefix(&self) -> bool {
        self.state == EntryState::FoldedPrefix
    }

    /// Bytes processed so far of an unfinished chunk (0 otherwise).
    pub fn offset(&self) -> u64 {
        match self.state {
            EntryState::Partial { offset } => offset,
            EntryState::Finished | EntryState::FoldedPrefix => 0,
        }
    }
}
