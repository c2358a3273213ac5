//! Filesystem side of a file transfer.
//!
//! The responder resolves a `GetFile` to a local file and describes it; the
//! requester, once every part is staged, verifies and moves the staged file
//! into place. Streaming the bytes is the caller's business.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use filesync_core::protocol::{FileMeta, GetFile};
use filesync_core::{CatalogEntry, ObjectKind, SyncAction, UserId};

use crate::engine::Engine;
use crate::error::{io_err, EngineError};
use crate::scan;

impl Engine {
    /// Local path and announced metadata for a peer's request. The hash is
    /// recomputed; the file may have changed since the request was made.
    pub fn describe_request(
        &self,
        request: &GetFile,
        owner: UserId,
    ) -> Result<(PathBuf, FileMeta), EngineError> {
        let (path, _) = self.resolve_remote(&request.path, &request.name, owner)?;
        let meta = fs::metadata(&path).map_err(|e| io_err(&path, e))?;
        if !meta.is_file() {
            return Err(EngineError::NotAFile { path });
        }
        let hash = self.hash(&path)?;
        let file_meta = FileMeta {
            name: request.name.clone(),
            path: request.path.clone(),
            hash,
            size: meta.len(),
            updated_at: scan::modified_at(&path, &meta)?,
            ext: scan::extension(&request.name),
        };
        Ok((path, file_meta))
    }

    /// Move a fully staged file into place and record it.
    ///
    /// 1. Hash the staged bytes; a mismatch discards them.
    /// 2. Record the `created` suppression for the destination.
    /// 3. Rename into place (copy when the staging area is on another
    ///    filesystem) and pin the announced modification time.
    /// 4. Upsert the catalog record.
    pub fn finish_transfer(
        &self,
        staged: &Path,
        meta: &FileMeta,
        owner: UserId,
    ) -> Result<PathBuf, EngineError> {
        let (dest, loc) = self.resolve_remote(&meta.path, &meta.name, owner)?;

        let actual = self.hash(staged)?;
        if actual != meta.hash {
            let _ = fs::remove_file(staged);
            return Err(EngineError::HashMismatch {
                path: dest,
                expected: meta.hash.clone(),
                actual,
            });
        }

        if let Some(parent) = dest.parent() {
            if !parent.is_dir() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }

        self.expect(&dest, SyncAction::Created);
        if let Err(err) = move_into_place(staged, &dest) {
            self.unexpect(&dest, SyncAction::Created);
            return Err(err);
        }
        scan::set_modified(&dest, meta.updated_at)?;

        let now = Utc::now();
        self.record(CatalogEntry {
            kind: ObjectKind::File,
            owner: loc.owner,
            path: loc.dir.clone(),
            name: loc.name.clone(),
            hash: meta.hash.clone(),
            size: meta.size,
            ext: scan::extension(&meta.name),
            fs_updated_at: meta.updated_at,
            created_at: now,
            updated_at: now,
            renamed: false,
        })?;
        tracing::info!("received {} ({} bytes)", dest.display(), meta.size);
        Ok(dest)
    }
}

fn move_into_place(staged: &Path, dest: &Path) -> Result<(), EngineError> {
    if fs::rename(staged, dest).is_ok() {
        return Ok(());
    }
    fs::copy(staged, dest).map_err(|e| io_err(dest, e))?;
    fs::remove_file(staged).map_err(|e| io_err(staged, e))
}
