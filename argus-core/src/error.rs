//! Error types for argus

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("index is not trained")]
    NotTrained,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("computation interrupted")]
    Interrupted,

    #[error("inverted lists are read-only")]
    ReadOnly,

    #[error("id not found: {0}")]
    IdNotFound(i64),

    #[error("incompatible indexes: {0}")]
    Incompatible(String),
}

pub type Result<T> = std::result::Result<T, Error>;
