use thiserror::Error;

/// Value encoding failures.
///
/// Raised when a value cannot be turned into a [`crate::CacheValue`] or when
/// a stored payload cannot be turned back into the requested type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode value: {0}")]
    Encode(String),

    #[error("Failed to decode value: {0}")]
    Decode(String),

    #[error("Type mismatch - expected: {expected}, stored: {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Compression error: {0}")]
    Compression(String),
}

/// Main error type for tiercache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Remote backend error: {0}")]
    Remote(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Remote(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::InvalidValue(e.to_string())
    }
}

/// Result type alias for tiercache operations
pub type Result<T> = std::result::Result<T, CacheError>;
