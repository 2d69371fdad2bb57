//! Error types for the blob cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    /// A driver variant could not be configured. Recovered by falling back
    /// to the default variant; fatal only if the fallback fails too.
    Config(String),
    Io(Box<std::io::Error>),
    /// Entry statistics (extended attributes or the embedded store) could
    /// not be read or written.
    Metadata(String),
    /// The content digest computed while tee'ing did not match the expected
    /// checksum. Recorded on the invalid entry, never surfaced to the
    /// content consumer.
    ChecksumMismatch {
        blob_id: String,
        expected: String,
        actual: String,
    },
    NotCached(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Metadata(msg) => write!(f, "Metadata error: {}", msg),
            CacheError::ChecksumMismatch {
                blob_id,
                expected,
                actual,
            } => write!(
                f,
                "Checksum verification failed for blob '{}': expected {}, got {}",
                blob_id, expected, actual
            ),
            CacheError::NotCached(blob_id) => write!(f, "Blob '{}' is not cached", blob_id),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Metadata(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
