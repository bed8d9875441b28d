use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmbedError>;

/// Failures of the external embedding service. These are transient from
/// the resolver's point of view: it logs and degrades to keyword-only.
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    #[error("embedding disabled by configuration")]
    Disabled,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}
