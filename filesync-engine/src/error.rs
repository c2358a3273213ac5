//! Error types for filesync-engine.

use std::path::PathBuf;

use thiserror::Error;

use filesync_core::protocol::ErrorCode;
use filesync_core::{CatalogError, NamespaceError};

/// All errors that can arise from reconciliation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("namespace error: {0}")]
    Namespace(#[from] NamespaceError),

    /// The local object changed after the peer's event was produced.
    #[error("local copy of {path} is newer than the remote change")]
    HaveNewerVersion { path: PathBuf },

    #[error("unknown sync action")]
    UnknownAction,

    #[error("cannot watch {path}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("staged content for {path} hashes to {actual}, expected {expected}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{path} is not a regular file")]
    NotAFile { path: PathBuf },
}

impl EngineError {
    /// Wire code reported to the peer for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::HaveNewerVersion { .. } => ErrorCode::HaveNewerVersion,
            EngineError::UnknownAction | EngineError::Namespace(_) => ErrorCode::BrokenMessage,
            _ => ErrorCode::Internal,
        }
    }

    /// Text safe to send to the peer. Local paths never leave the process
    /// and internal failures stay opaque.
    pub fn explained(&self) -> String {
        let text = match self {
            EngineError::HaveNewerVersion { .. } => "local copy is newer than the remote change",
            EngineError::UnknownAction => "unknown sync action",
            EngineError::Namespace(_) => "invalid path or name",
            _ => "",
        };
        text.to_string()
    }
}

/// Convenience constructor for [`EngineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
