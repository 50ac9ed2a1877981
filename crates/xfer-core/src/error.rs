use thiserror::Error;

pub type XferResult<T> = Result<T, XferError>;

#[derive(Debug, Error)]
pub enum XferError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
