//! Local filesystem events to outgoing sync events.
//!
//! ## `process_local`
//!
//! 1. Swallow the event if the echo buffer expects it.
//! 2. Map the path to its catalog location; skip what no peer may see.
//! 3. `create`/`write`: stat and hash the object, diff against the catalog,
//!    upsert, emit `created`, `updated` or nothing. A created file whose
//!    hash matches a record flagged as renamed collapses into `renamed`.
//! 4. `remove`: drop the record (cascading for folders), emit `deleted`.
//! 5. `rename`: flag the record and emit nothing; step 3 pairs it up.
//!
//! A directory is registered with the watcher and scanned before anything
//! is emitted, since it can arrive already populated.

use std::fs::Metadata;
use std::path::Path;

use filesync_core::SyncAction;

use crate::engine::{Engine, Located, OutgoingEvent};
use crate::error::EngineError;
use crate::scan;
use crate::watch::{FsEvent, FsOp};

impl Engine {
    /// Reconcile one watcher event.
    pub fn process_local(&self, event: &FsEvent) -> Result<Vec<OutgoingEvent>, EngineError> {
        if self.echo.consume(&event.path, event.op.echo_action()) {
            tracing::debug!("suppressed echo {:?} {}", event.op, event.path.display());
            return Ok(Vec::new());
        }

        let Some(loc) = self.locate(&event.path) else {
            return self.process_unowned(event);
        };

        match event.op {
            FsOp::Create | FsOp::Write => self.reconcile_path(&event.path, &loc),
            FsOp::Remove => Ok(self
                .forget(&loc.key())?
                .map(|old| self.tombstone(&old))
                .into_iter()
                .collect()),
            FsOp::Rename => self.mark_renamed(&loc),
        }
    }

    /// Diff everything beneath `dir` against the catalog. Unchanged objects
    /// produce nothing, so a second pass over the same tree is silent.
    pub fn reconcile_dir(&self, dir: &Path) -> Result<Vec<OutgoingEvent>, EngineError> {
        self.batched(|| {
            let mut out = Vec::new();
            for path in scan::walk(dir)? {
                let Some(meta) = scan::stat(&path)? else {
                    continue;
                };
                if meta.is_dir() {
                    self.watch(&path)?;
                }
                if let Some(loc) = self.locate(&path) {
                    out.extend(self.reconcile_entry(&path, &loc, &meta)?);
                }
            }
            Ok(out)
        })
    }

    /// A new per-user directory on a multi-tenant root has no owner itself,
    /// but its contents do.
    fn process_unowned(&self, event: &FsEvent) -> Result<Vec<OutgoingEvent>, EngineError> {
        if event.op != FsOp::Create || !event.path.starts_with(self.root()) {
            return Ok(Vec::new());
        }
        match scan::stat(&event.path)? {
            Some(meta) if meta.is_dir() => {
                self.watch(&event.path)?;
                self.reconcile_dir(&event.path)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn reconcile_path(&self, path: &Path, loc: &Located) -> Result<Vec<OutgoingEvent>, EngineError> {
        let Some(meta) = scan::stat(path)? else {
            tracing::debug!("{} vanished before it could be reconciled", path.display());
            return Ok(Vec::new());
        };
        if !meta.is_dir() {
            return self.reconcile_entry(path, loc, &meta);
        }

        self.watch(path)?;
        let mut out = self.reconcile_entry(path, loc, &meta)?;
        out.extend(self.reconcile_dir(path)?);
        Ok(out)
    }

    fn reconcile_entry(
        &self,
        path: &Path,
        loc: &Located,
        meta: &Metadata,
    ) -> Result<Vec<OutgoingEvent>, EngineError> {
        let fresh = self.entry_for(path, loc, meta)?;
        let mut out = Vec::new();

        let action = match self.catalog.get(&loc.key())? {
            None => match self.catalog.find_renamed(loc.owner, &fresh.hash)? {
                Some(stale) if !fresh.is_folder() => {
                    self.catalog.delete(&stale.key())?;
                    tracing::debug!("{} renamed to {}", stale.key(), loc.key());
                    Some(SyncAction::Renamed)
                }
                _ => Some(SyncAction::Created),
            },
            Some(old) if old.kind != fresh.kind => {
                self.forget(&old.key())?;
                out.push(self.tombstone(&old));
                Some(SyncAction::Created)
            }
            Some(old) if old.content_differs(&fresh) => Some(SyncAction::Updated),
            // Nothing to store either.
            Some(old) if old.fs_updated_at == fresh.fs_updated_at && !old.renamed => {
                return Ok(out)
            }
            Some(_) => None,
        };

        let entry = self.record(fresh)?;
        if let Some(action) = action {
            out.push(self.outgoing(&entry, action));
        }
        Ok(out)
    }

    fn mark_renamed(&self, loc: &Located) -> Result<Vec<OutgoingEvent>, EngineError> {
        let Some(mut old) = self.catalog.get(&loc.key())? else {
            return Ok(Vec::new());
        };
        // Folders carry no hash to pair on; a renamed folder is a removal
        // followed by the creation of its new name.
        if old.is_folder() {
            return Ok(self
                .forget(&old.key())?
                .map(|old| self.tombstone(&old))
                .into_iter()
                .collect());
        }
        old.renamed = true;
        self.catalog.upsert(old)?;
        Ok(Vec::new())
    }
}
