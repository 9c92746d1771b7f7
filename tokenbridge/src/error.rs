//! Error types for tokenbridge

use thiserror::Error;

/// Result type alias using tokenbridge's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tokenbridge operations
///
/// Backend adapters translate their engine-specific failures into these
/// variants, so callers never see a backend-shaped error.
#[derive(Error, Debug)]
pub enum Error {
    /// The vocabulary cannot answer a lookup that must always succeed.
    #[error("Vocabulary integrity error: {0}")]
    Integrity(String),

    /// The backend does not offer the requested capability.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The underlying engine reported a failure.
    #[error("Foreign engine error: {0}")]
    Foreign(String),

    #[error("Handle not registered: {0:#x}")]
    HandleNotFound(usize),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
