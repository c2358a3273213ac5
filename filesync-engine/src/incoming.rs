//! Peer sync events applied to the local tree.
//!
//! Every mutation records its echo suppression first and disarms it again
//! if the mutation fails. File content is never written here: a `created`
//! or changed `updated` file yields [`Applied::Fetch`] and the caller runs
//! the transfer.

use std::fs::{self, Metadata};
use std::path::Path;

use filesync_core::protocol::{GetFile, SyncEvent};
use filesync_core::{ObjectKind, SyncAction};

use crate::engine::{Applied, Engine, Located};
use crate::error::{io_err, EngineError};
use crate::scan;

impl Engine {
    /// Apply one event received from the peer `owner` (ignored on a
    /// single-tenant engine).
    pub fn apply_remote(
        &self,
        event: &SyncEvent,
        owner: filesync_core::UserId,
    ) -> Result<Applied, EngineError> {
        match event.action {
            SyncAction::Renamed | SyncAction::Any | SyncAction::NoAction => {
                return Ok(Applied::Ignored)
            }
            SyncAction::Unknown => return Err(EngineError::UnknownAction),
            SyncAction::Created | SyncAction::Updated | SyncAction::Deleted => {}
        }

        let (path, loc) = self.resolve_remote(&event.path, &event.name, owner)?;
        tracing::debug!("applying remote {} {} {}", event.action, event.object_kind, path.display());

        match (event.action, event.object_kind) {
            (SyncAction::Deleted, _) => self.apply_delete(event, &path, &loc),
            (_, ObjectKind::Folder) => self.apply_folder(event, &path, &loc),
            (_, ObjectKind::File) => self.apply_file(event, &path, &loc),
        }
    }

    fn apply_delete(
        &self,
        event: &SyncEvent,
        path: &Path,
        loc: &Located,
    ) -> Result<Applied, EngineError> {
        let Some(meta) = scan::stat(path)? else {
            self.forget(&loc.key())?;
            return Ok(Applied::Done);
        };

        if scan::modified_at(path, &meta)? > event.new_updated_at {
            return Err(EngineError::HaveNewerVersion {
                path: path.to_path_buf(),
            });
        }

        self.expect(path, SyncAction::Deleted);
        self.forget(&loc.key())?;
        let removed = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(err) = removed {
            self.unexpect(path, SyncAction::Deleted);
            return Err(io_err(path, err));
        }
        Ok(Applied::Done)
    }

    fn apply_folder(
        &self,
        event: &SyncEvent,
        path: &Path,
        loc: &Located,
    ) -> Result<Applied, EngineError> {
        match scan::stat(path)? {
            Some(meta) if meta.is_dir() => {}
            Some(_) => {
                return Err(io_err(
                    path,
                    std::io::Error::new(std::io::ErrorKind::AlreadyExists, "a file has this name"),
                ))
            }
            None => {
                self.expect(path, SyncAction::Created);
                if let Err(err) = fs::create_dir_all(path) {
                    self.unexpect(path, SyncAction::Created);
                    return Err(io_err(path, err));
                }
            }
        }

        scan::set_modified(path, event.new_updated_at)?;
        self.watch(path)?;
        self.record_current(path, loc)?;
        // Objects already inside are left to their own watcher events, which
        // would otherwise find them catalogued and emit nothing.
        Ok(Applied::Done)
    }

    fn apply_file(
        &self,
        event: &SyncEvent,
        path: &Path,
        loc: &Located,
    ) -> Result<Applied, EngineError> {
        match scan::stat(path)? {
            Some(meta) if meta.is_file() => {
                if self.hash(path)? == event.hash {
                    scan::set_modified(path, event.new_updated_at)?;
                    self.record_current(path, loc)?;
                    return Ok(Applied::Done);
                }
            }
            Some(_) => {
                return Err(EngineError::NotAFile {
                    path: path.to_path_buf(),
                })
            }
            None => {}
        }

        Ok(Applied::Fetch(GetFile {
            name: event.name.clone(),
            path: event.path.clone(),
            hash: event.hash.clone(),
            updated_at: event.new_updated_at,
        }))
    }

    /// Re-stat `path` and store what is on disk now.
    fn record_current(&self, path: &Path, loc: &Located) -> Result<(), EngineError> {
        let meta: Metadata = fs::symlink_metadata(path).map_err(|e| io_err(path, e))?;
        let entry = self.entry_for(path, loc, &meta)?;
        self.record(entry)?;
        Ok(())
    }

    /// Suppress the watcher event for `path` and the parent directory's
    /// update that accompanies it.
    pub(crate) fn expect(&self, path: &Path, action: SyncAction) {
        self.echo.push(path, action);
        if let Some(parent) = path.parent() {
            self.echo.push(parent, SyncAction::Updated);
        }
    }

    pub(crate) fn unexpect(&self, path: &Path, action: SyncAction) {
        self.echo.disarm(path, action);
        if let Some(parent) = path.parent() {
            self.echo.disarm(parent, SyncAction::Updated);
        }
    }
}
