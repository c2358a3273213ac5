//! Error types for filesync-core.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while mapping between local paths and escaped peer paths.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("path {path} is outside the synchronized root")]
    OutsideRoot { path: PathBuf },

    #[error("path {path} is not valid UTF-8")]
    NonUtf8 { path: PathBuf },

    #[error("escaped path '{0}' does not start with the root token")]
    MissingRoot(String),

    #[error("escaped path '{path}' has an illegal segment '{segment}'")]
    IllegalSegment { path: String, segment: String },

    #[error("invalid object name '{0}'")]
    InvalidName(String),
}

/// All errors that can arise from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The catalog document on disk could not be parsed.
    #[error("catalog JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("catalog lock poisoned")]
    Poisoned,
}

/// Decoding failures for a single frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not JSON, or a payload that does not fit its declared kind.
    #[error("broken message: {0}")]
    Broken(#[from] serde_json::Error),

    #[error("unknown message kind {0}")]
    UnknownKind(u64),
}

/// Configuration loading and validation failures. All of them are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path and serde_yaml's line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("sync root {path} is unusable: {reason}")]
    BadRoot { path: PathBuf, reason: String },
}

pub(crate) fn catalog_io(path: impl Into<PathBuf>, source: std::io::Error) -> CatalogError {
    CatalogError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn config_io(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
