//! The reconciliation engine.
//!
//! One [`Engine`] owns a synchronized root. It is shared between the task
//! consuming watcher events and the tasks serving peer connections, so all
//! state lives behind the catalog's and the echo buffer's own locks.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use filesync_core::hasher::{self, RetryPolicy};
use filesync_core::namespace::{self, NamespaceCodec};
use filesync_core::protocol::{GetFile, SyncEvent};
use filesync_core::{CatalogEntry, CatalogKey, CatalogStore, ObjectKind, SyncAction, UserId};

use crate::echo::EchoBuffer;
use crate::error::{io_err, EngineError};
use crate::scan;
use crate::watch::{DirWatcher, NoopWatcher};

/// How objects under the root map to owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tenancy {
    /// The whole root belongs to one party. Every object has owner
    /// [`UserId::NONE`] and every change is emitted.
    Single,
    /// `<root>/<uid>/…` belongs to user `uid`. Objects directly under the
    /// root have no owner and are never emitted; peers see paths with their
    /// own segment removed.
    PerUser,
}

/// A reconciled local change and the user whose sessions should receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEvent {
    pub owner: UserId,
    pub event: SyncEvent,
}

/// Outcome of applying a peer's event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The local tree and the catalog now agree with the event.
    Done,
    /// The content has to be fetched from the peer.
    Fetch(GetFile),
    /// Placeholder or rename actions that need no local work.
    Ignored,
}

/// Where an object lives in the catalog.
#[derive(Debug, Clone)]
pub(crate) struct Located {
    pub owner: UserId,
    /// Escaped parent directory, owner segment included.
    pub dir: String,
    pub name: String,
}

impl Located {
    pub fn key(&self) -> CatalogKey {
        CatalogKey::new(self.owner, self.dir.clone(), self.name.clone())
    }
}

pub struct Engine {
    pub(crate) namespace: NamespaceCodec,
    pub(crate) tenancy: Tenancy,
    pub(crate) catalog: Arc<dyn CatalogStore>,
    pub(crate) echo: EchoBuffer,
    pub(crate) watcher: Arc<dyn DirWatcher>,
    pub(crate) retry: RetryPolicy,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            namespace: NamespaceCodec::new(root),
            tenancy: Tenancy::Single,
            catalog,
            echo: EchoBuffer::new(),
            watcher: Arc::new(NoopWatcher),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_tenancy(mut self, tenancy: Tenancy) -> Self {
        self.tenancy = tenancy;
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn DirWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        self.namespace.root()
    }

    pub fn tenancy(&self) -> Tenancy {
        self.tenancy
    }

    pub fn catalog(&self) -> &dyn CatalogStore {
        self.catalog.as_ref()
    }

    /// Drop the catalog and rebuild it from a full scan of the root,
    /// registering every directory with the watcher. Emits nothing.
    pub fn initialize(&self) -> Result<usize, EngineError> {
        let root = self.root().to_path_buf();
        let discovered = self.batched(|| {
            self.catalog.reset()?;
            self.watch(&root)?;
            Ok(self.reconcile_dir(&root)?.len())
        })?;
        let recorded = self.catalog.len()?;
        tracing::info!(
            "catalog rebuilt from {}: {} records ({} new objects)",
            root.display(),
            recorded,
            discovered
        );
        Ok(recorded)
    }

    // -----------------------------------------------------------------------
    // Path mapping
    // -----------------------------------------------------------------------

    /// Catalog location of a local path, or `None` for the root itself,
    /// paths outside it, and (multi-tenant) objects no user owns.
    pub(crate) fn locate(&self, path: &Path) -> Option<Located> {
        let (dir, name) = match self.namespace.locate(path) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::debug!("skipping {}: {}", path.display(), err);
                return None;
            }
        };
        let owner = match self.tenancy {
            Tenancy::Single => UserId::NONE,
            Tenancy::PerUser => {
                let owner = namespace::owner_of(&dir);
                if owner.is_none() {
                    return None;
                }
                owner
            }
        };
        Some(Located { owner, dir, name })
    }

    /// Local path and catalog location of an object named by a peer.
    pub(crate) fn resolve_remote(
        &self,
        peer_dir: &str,
        name: &str,
        owner: UserId,
    ) -> Result<(PathBuf, Located), EngineError> {
        let (owner, dir) = match self.tenancy {
            Tenancy::Single => (UserId::NONE, peer_dir.to_string()),
            Tenancy::PerUser => (owner, namespace::insert_user(peer_dir, owner)),
        };
        let path = self.namespace.resolve(&dir, name)?;
        Ok((
            path,
            Located {
                owner,
                dir,
                name: name.to_string(),
            },
        ))
    }

    /// Escaped directory as the owning peer sees it.
    pub(crate) fn peer_dir(&self, dir: &str, owner: UserId) -> String {
        match self.tenancy {
            Tenancy::Single => dir.to_string(),
            Tenancy::PerUser => namespace::extract_user(dir, owner),
        }
    }

    pub(crate) fn outgoing(&self, entry: &CatalogEntry, action: SyncAction) -> OutgoingEvent {
        OutgoingEvent {
            owner: entry.owner,
            event: SyncEvent {
                action,
                object_kind: entry.kind,
                name: entry.name.clone(),
                path: self.peer_dir(&entry.path, entry.owner),
                hash: entry.hash.clone(),
                new_updated_at: entry.fs_updated_at,
            },
        }
    }

    /// `deleted` event for a record just dropped. A file carries its last
    /// known modification time so a peer holding a newer copy can refuse.
    /// A folder's own mtime moves whenever its contents change, so it
    /// carries the time of deletion instead.
    pub(crate) fn tombstone(&self, old: &CatalogEntry) -> OutgoingEvent {
        let mut out = self.outgoing(old, SyncAction::Deleted);
        if old.is_folder() {
            out.event.new_updated_at = Utc::now();
        }
        out
    }

    // -----------------------------------------------------------------------
    // Filesystem helpers
    // -----------------------------------------------------------------------

    pub(crate) fn watch(&self, dir: &Path) -> Result<(), EngineError> {
        self.watcher
            .watch_dir(dir)
            .map_err(|message| EngineError::Watch {
                path: dir.to_path_buf(),
                message,
            })
    }

    pub(crate) fn hash(&self, path: &Path) -> Result<String, EngineError> {
        hasher::hash_file_with_retry(path, &self.retry).map_err(|e| io_err(path, e))
    }

    /// A fresh catalog record for the object at `path`.
    pub(crate) fn entry_for(
        &self,
        path: &Path,
        loc: &Located,
        meta: &Metadata,
    ) -> Result<CatalogEntry, EngineError> {
        let now = Utc::now();
        let (kind, hash, size) = if meta.is_dir() {
            (ObjectKind::Folder, String::new(), 0)
        } else {
            (ObjectKind::File, self.hash(path)?, meta.len())
        };
        Ok(CatalogEntry {
            kind,
            owner: loc.owner,
            path: loc.dir.clone(),
            name: loc.name.clone(),
            hash,
            size,
            ext: if kind == ObjectKind::File {
                scan::extension(&loc.name)
            } else {
                String::new()
            },
            fs_updated_at: scan::modified_at(path, meta)?,
            created_at: now,
            updated_at: now,
            renamed: false,
        })
    }

    /// Insert or refresh a record, keeping its original creation time.
    pub(crate) fn record(&self, mut entry: CatalogEntry) -> Result<CatalogEntry, EngineError> {
        if let Some(existing) = self.catalog.get(&entry.key())? {
            entry.created_at = existing.created_at;
        }
        entry.updated_at = Utc::now();
        entry.renamed = false;
        self.catalog.upsert(entry.clone())?;
        Ok(entry)
    }

    /// Run `work` as one catalog batch: the store persists once at the end
    /// instead of after every record.
    pub(crate) fn batched<T>(
        &self,
        work: impl FnOnce() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.catalog.begin_batch();
        let result = work();
        let flushed = self.catalog.end_batch();
        let value = result?;
        flushed?;
        Ok(value)
    }

    /// Remove a record, cascading to everything beneath it for folders.
    pub(crate) fn forget(&self, key: &CatalogKey) -> Result<Option<CatalogEntry>, EngineError> {
        let Some(old) = self.catalog.delete(key)? else {
            return Ok(None);
        };
        if old.is_folder() {
            let nested = self.catalog.delete_nested(old.owner, &old.full_path())?;
            tracing::debug!("dropped {} nested records under {}", nested, old.key());
        }
        Ok(Some(old))
    }
}
