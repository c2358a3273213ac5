//! Catalog store: the record of known files and folders.
//!
//! The engine only needs a narrow contract ([`CatalogStore`]). Two stores
//! ship with the crate:
//!
//! - [`MemoryCatalog`]: a locked `BTreeMap`, used directly in tests.
//! - [`JsonCatalog`]: a [`MemoryCatalog`] persisted as one JSON document.
//!   Writes use the atomic `.tmp` + rename pattern. Inside a batch the
//!   document is written once, when the batch ends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{catalog_io, CatalogError};
use crate::namespace::is_within;
use crate::types::{CatalogEntry, CatalogKey, ObjectKind, UserId};

/// Record store consumed by the reconciliation engine. Implementations are
/// shared across tasks and must be internally synchronized.
pub trait CatalogStore: Send + Sync {
    /// Insert or replace the record with the same key.
    fn upsert(&self, entry: CatalogEntry) -> Result<(), CatalogError>;

    fn get(&self, key: &CatalogKey) -> Result<Option<CatalogEntry>, CatalogError>;

    /// Remove one record, returning it if it existed.
    fn delete(&self, key: &CatalogKey) -> Result<Option<CatalogEntry>, CatalogError>;

    /// Remove every record of `owner` whose directory is `dir` or lies
    /// beneath it. Returns the number of records removed.
    fn delete_nested(&self, owner: UserId, dir: &str) -> Result<usize, CatalogError>;

    /// A file record of `owner` flagged as renamed away whose content hash
    /// is `hash`.
    fn find_renamed(&self, owner: UserId, hash: &str)
        -> Result<Option<CatalogEntry>, CatalogError>;

    /// Drop every record.
    fn reset(&self) -> Result<(), CatalogError>;

    fn len(&self) -> Result<usize, CatalogError>;

    /// Defer persistence until the matching [`end_batch`](Self::end_batch).
    /// Batches nest; stores without persistence ignore them.
    fn begin_batch(&self) {}

    /// Close a batch, persisting whatever it deferred once the outermost
    /// batch ends.
    fn end_batch(&self) -> Result<(), CatalogError> {
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, CatalogError> {
        Ok(self.len()? == 0)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<BTreeMap<CatalogKey, CatalogEntry>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<CatalogKey, CatalogEntry>>, CatalogError> {
        self.entries.lock().map_err(|_| CatalogError::Poisoned)
    }

    fn snapshot(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn replace_all(&self, entries: Vec<CatalogEntry>) -> Result<(), CatalogError> {
        let mut guard = self.lock()?;
        guard.clear();
        for entry in entries {
            guard.insert(entry.key(), entry);
        }
        Ok(())
    }
}

impl CatalogStore for MemoryCatalog {
    fn upsert(&self, entry: CatalogEntry) -> Result<(), CatalogError> {
        self.lock()?.insert(entry.key(), entry);
        Ok(())
    }

    fn get(&self, key: &CatalogKey) -> Result<Option<CatalogEntry>, CatalogError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn delete(&self, key: &CatalogKey) -> Result<Option<CatalogEntry>, CatalogError> {
        Ok(self.lock()?.remove(key))
    }

    fn delete_nested(&self, owner: UserId, dir: &str) -> Result<usize, CatalogError> {
        let mut guard = self.lock()?;
        let before = guard.len();
        guard.retain(|key, _| key.owner != owner || !is_within(&key.path, dir));
        Ok(before - guard.len())
    }

    fn find_renamed(
        &self,
        owner: UserId,
        hash: &str,
    ) -> Result<Option<CatalogEntry>, CatalogError> {
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(self
            .lock()?
            .values()
            .find(|e| {
                e.renamed && e.owner == owner && e.kind == ObjectKind::File && e.hash == hash
            })
            .cloned())
    }

    fn reset(&self) -> Result<(), CatalogError> {
        self.lock()?.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, CatalogError> {
        Ok(self.lock()?.len())
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// On-disk catalog payload.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    saved_at: DateTime<Utc>,
    entries: Vec<CatalogEntry>,
}

/// A [`MemoryCatalog`] mirrored to a JSON file after every mutation, or
/// once per batch.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    inner: MemoryCatalog,
    // Serializes writers so the file never lags behind the map.
    persist_lock: Mutex<()>,
    batch_depth: AtomicUsize,
    dirty: AtomicBool,
}

impl JsonCatalog {
    /// Open the catalog at `path`. A missing file yields an empty catalog.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let inner = MemoryCatalog::new();
        if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| catalog_io(&path, e))?;
            let file: CatalogFile = serde_json::from_str(&contents)?;
            inner.replace_all(file.entries)?;
        }
        Ok(Self {
            path,
            inner,
            persist_lock: Mutex::new(()),
            batch_depth: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist now, or mark the document dirty while a batch is open.
    fn changed(&self) -> Result<(), CatalogError> {
        if self.batch_depth.load(Ordering::SeqCst) > 0 {
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(());
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), CatalogError> {
        let _guard = self.persist_lock.lock().map_err(|_| CatalogError::Poisoned)?;
        let document = CatalogFile {
            saved_at: Utc::now(),
            entries: self.inner.snapshot()?,
        };

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| catalog_io(dir, e))?;
        }
        let json = serde_json::to_string(&document)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| catalog_io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| catalog_io(&self.path, e))?;
        Ok(())
    }
}

impl CatalogStore for JsonCatalog {
    fn upsert(&self, entry: CatalogEntry) -> Result<(), CatalogError> {
        self.inner.upsert(entry)?;
        self.changed()
    }

    fn get(&self, key: &CatalogKey) -> Result<Option<CatalogEntry>, CatalogError> {
        self.inner.get(key)
    }

    fn delete(&self, key: &CatalogKey) -> Result<Option<CatalogEntry>, CatalogError> {
        let removed = self.inner.delete(key)?;
        if removed.is_some() {
            self.changed()?;
        }
        Ok(removed)
    }

    fn delete_nested(&self, owner: UserId, dir: &str) -> Result<usize, CatalogError> {
        let removed = self.inner.delete_nested(owner, dir)?;
        if removed > 0 {
            self.changed()?;
        }
        Ok(removed)
    }

    fn find_renamed(
        &self,
        owner: UserId,
        hash: &str,
    ) -> Result<Option<CatalogEntry>, CatalogError> {
        self.inner.find_renamed(owner, hash)
    }

    fn reset(&self) -> Result<(), CatalogError> {
        self.inner.reset()?;
        self.changed()
    }

    fn len(&self) -> Result<usize, CatalogError> {
        self.inner.len()
    }

    fn begin_batch(&self) {
        self.batch_depth.fetch_add(1, Ordering::SeqCst);
    }

    fn end_batch(&self) -> Result<(), CatalogError> {
        let outer = self
            .batch_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                Some(depth.saturating_sub(1))
            })
            .map_or(true, |depth| depth <= 1);
        if outer && self.dirty.swap(false, Ordering::SeqCst) {
            self.persist()?;
        }
        Ok(())
    }
}
