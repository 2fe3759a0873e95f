use thiserror::Error;

use crate::query::errors::CompileError;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ReliqError>;

/// Top-level error surfaced to embedders.
#[derive(Debug, Error)]
pub enum ReliqError {
    /// Query compilation failed; the query cannot be translated.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// The domain model itself is malformed.
    #[error("invalid model: {0}")]
    InvalidModel(String),
    /// Caller supplied an argument outside the supported range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
