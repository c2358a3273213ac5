use std::path::PathBuf;

use thiserror::Error;

use filesync_core::protocol::{ErrorCode, MessageKind};
use filesync_core::{CatalogError, CodecError, ConfigError};
use filesync_engine::EngineError;

/// Error surface for the transport, sessions and both runtimes.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("frame is not valid UTF-8")]
    FrameNotUtf8,

    #[error("stream ended inside a frame ({bytes} bytes buffered)")]
    PartialFrame { bytes: usize },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A session-level rejection, sent or received.
    #[error("session rejected: {code:?} {explained}")]
    Rejected { code: ErrorCode, explained: String },

    #[error("unexpected {kind} while {stage}")]
    Unexpected { kind: MessageKind, stage: String },

    #[error("{0} without a matching file request")]
    Unsolicited(MessageKind),

    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("daemon protocol error: {0}")]
    Protocol(String),
}

/// Which side a per-connection failure is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The peer sent something it should not have.
    Peer,
    /// We failed to serve a well-formed request.
    Local,
    /// Reported to the peer but charged to nobody.
    Neither,
}

impl DaemonError {
    /// Wire code reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            DaemonError::Engine(err) => err.code(),
            DaemonError::Codec(CodecError::UnknownKind(_)) | DaemonError::Unexpected { .. } => {
                ErrorCode::UnknownMessageType
            }
            DaemonError::Codec(_)
            | DaemonError::FrameTooLarge { .. }
            | DaemonError::FrameNotUtf8
            | DaemonError::Unsolicited(_)
            | DaemonError::FileTooLarge { .. } => ErrorCode::BrokenMessage,
            DaemonError::Rejected { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Text safe to send to the peer; local paths and internals stay here.
    pub fn explained(&self) -> String {
        match self {
            DaemonError::Engine(err) => err.explained(),
            DaemonError::Codec(_)
            | DaemonError::FrameTooLarge { .. }
            | DaemonError::FrameNotUtf8
            | DaemonError::Unexpected { .. }
            | DaemonError::Unsolicited(_)
            | DaemonError::FileTooLarge { .. } => self.to_string(),
            _ => String::new(),
        }
    }

    pub fn fault(&self) -> Fault {
        // A refused file is one object's conflict, not session misconduct.
        if let DaemonError::FileTooLarge { .. } = self {
            return Fault::Neither;
        }
        match self.code() {
            ErrorCode::Internal => Fault::Local,
            ErrorCode::HaveNewerVersion | ErrorCode::IncompatibleConditions => Fault::Neither,
            _ => Fault::Peer,
        }
    }

    /// Failures of the connection itself, after which nothing more can be
    /// read or written.
    pub fn ends_connection(&self) -> bool {
        matches!(
            self,
            DaemonError::Transport(_)
                | DaemonError::PartialFrame { .. }
                | DaemonError::ChannelClosed(_)
                | DaemonError::PeerClosed
        )
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
