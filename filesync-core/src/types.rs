//! Domain types for the filesync catalog.
//!
//! Catalog records are addressed by escaped paths (see [`crate::namespace`]),
//! never by raw `PathBuf`s, so the same key is valid on both parties.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Numeric id of a user on the server. `0` marks objects outside any
/// user's synchronized namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl UserId {
    /// Owner of objects that belong to nobody. Also the owner of every
    /// object on a single-tenant party.
    pub const NONE: UserId = UserId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether a catalog record describes a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Folder,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::File => write!(f, "file"),
            ObjectKind::Folder => write!(f, "folder"),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog records
// ---------------------------------------------------------------------------

/// Unique identity of a catalog record.
///
/// `path` is the escaped path of the containing directory, including the
/// owner's segment on a multi-tenant server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogKey {
    pub owner: UserId,
    pub path: String,
    pub name: String,
}

impl CatalogKey {
    pub fn new(owner: UserId, path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner,
            path: path.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.owner, self.path, self.name)
    }
}

/// One known file or folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub kind: ObjectKind,
    pub owner: UserId,
    pub path: String,
    pub name: String,
    /// SHA-256 hex digest; empty for folders.
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    /// Extension without the leading dot; empty when absent.
    #[serde(default)]
    pub ext: String,
    pub fs_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the watcher reported the object renamed away; cleared when
    /// the record is collapsed into a rename or rewritten.
    #[serde(default)]
    pub renamed: bool,
}

impl CatalogEntry {
    pub fn key(&self) -> CatalogKey {
        CatalogKey::new(self.owner, self.path.clone(), self.name.clone())
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ObjectKind::Folder
    }

    /// Escaped path of this object itself, i.e. the path its children live
    /// under.
    pub fn full_path(&self) -> String {
        crate::namespace::join_escaped(&self.path, &self.name)
    }

    /// True when the content-bearing attributes differ. Timestamps and the
    /// rename marker are bookkeeping and do not count.
    pub fn content_differs(&self, other: &CatalogEntry) -> bool {
        self.kind != other.kind || self.hash != other.hash || self.size != other.size
    }
}
