//! Filesystem watcher seam.
//!
//! The engine never talks to an OS notifier directly. It consumes
//! [`FsEvent`]s and asks a [`DirWatcher`] to start watching directories it
//! creates or discovers.

use std::path::{Path, PathBuf};

use filesync_core::SyncAction;

/// Raw change kinds reported by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Create,
    Write,
    Remove,
    /// The object at this path was renamed away. Its new name arrives as a
    /// separate `Create`.
    Rename,
}

impl FsOp {
    /// The suppression action that swallows this op.
    pub fn echo_action(self) -> SyncAction {
        match self {
            FsOp::Create => SyncAction::Created,
            FsOp::Write => SyncAction::Updated,
            FsOp::Remove | FsOp::Rename => SyncAction::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub op: FsOp,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, op: FsOp) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }
}

/// Registers directories with the OS notifier. Watches are non-recursive,
/// so every directory in the tree is registered on its own.
pub trait DirWatcher: Send + Sync {
    fn watch_dir(&self, dir: &Path) -> Result<(), String>;
}

/// Watcher that watches nothing. Used by tests and one-shot scans.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcher;

impl DirWatcher for NoopWatcher {
    fn watch_dir(&self, _dir: &Path) -> Result<(), String> {
        Ok(())
    }
}
