use thiserror::Error;
use xfer_crypto::FileTag;

pub type IntegrityResult<T> = Result<T, IntegrityError>;

#[derive(Debug, Error)]
pub enum IntegrityError {
    /// Serialized table is truncated or violates table invariants.
    /// The table must be discarded and the transfer restarted.
    #[error("malformed chunk MAC state: {0}")]
    MalformedState(String),

    /// The caller addressed bytes outside a chunk's legal span, or already
    /// folded history. The calling layer has lost sync with the table.
    #[error("chunk access out of range: {0}")]
    OutOfRange(String),

    /// Data does not authenticate against the expected file tag.
    #[error("file tag mismatch: expected {expected}, computed {computed}")]
    TagMismatch { expected: FileTag, computed: FileTag },

    #[error("chunk MAC state cannot be encoded: {0}")]
    Unencodable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
