//! Error types for the artifacts crate

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during artifact store operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Entry metadata could not be serialized
    #[error("failed to encode entry metadata: {0}")]
    Encode(#[from] serde_json::Error),

    /// A stored entry no longer matches the key it is filed under
    #[error("cache entry {key} is corrupt: {detail}")]
    CacheCorruption { key: String, detail: String },

    /// A rendered file path would land outside its destination root
    #[error("artifact path escapes destination root: {0}")]
    UnsafePath(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the store content cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CacheCorruption { .. })
    }
}

/// Result type for artifact store operations
pub type Result<T> = std::result::Result<T, Error>;
