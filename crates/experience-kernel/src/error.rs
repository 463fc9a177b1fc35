//! Error types for snapshot persistence.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("no experience snapshot found: {path}")]
    SnapshotNotFound { path: PathBuf },

    #[error("snapshot already exists: {path}")]
    SnapshotExists { path: PathBuf },

    #[error("snapshot I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;
