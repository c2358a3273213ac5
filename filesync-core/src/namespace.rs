//! Namespace escaping.
//!
//! Local paths never cross the wire. An object under the synchronized root
//! is addressed by an *escaped path*: the root prefix is replaced by
//! [`ROOT_TOKEN`] and every separator by [`DELIMITER`]:
//!
//! ```text
//! /srv/sync/docs/a.txt   ->   %ROOT_DIR%,docs,a.txt
//! ```
//!
//! Segments are percent-encoded (`%` as `%25`, `,` as `%2C`) so that any
//! UTF-8 name survives the round trip. On a multi-tenant server every user
//! owns the subtree `<root>/<uid>`; [`insert_user`] and [`extract_user`] add
//! and strip that segment so a peer never sees its own id.

use std::path::{Component, Path, PathBuf};

use crate::error::NamespaceError;
use crate::types::UserId;

/// Symbolic stand-in for the configured root directory.
pub const ROOT_TOKEN: &str = "%ROOT_DIR%";

/// Replaces the filesystem separator in escaped paths.
pub const DELIMITER: char = ',';

/// Converts between local paths under one root and escaped peer paths.
#[derive(Debug, Clone)]
pub struct NamespaceCodec {
    root: PathBuf,
}

impl NamespaceCodec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Escape an absolute path under the root.
    pub fn escape(&self, path: &Path) -> Result<String, NamespaceError> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| NamespaceError::OutsideRoot {
                path: path.to_path_buf(),
            })?;

        let mut escaped = String::from(ROOT_TOKEN);
        for component in relative.components() {
            let Component::Normal(segment) = component else {
                return Err(NamespaceError::OutsideRoot {
                    path: path.to_path_buf(),
                });
            };
            let segment = segment.to_str().ok_or_else(|| NamespaceError::NonUtf8 {
                path: path.to_path_buf(),
            })?;
            escaped.push(DELIMITER);
            escaped.push_str(&encode_segment(segment));
        }
        Ok(escaped)
    }

    /// Inverse of [`escape`](Self::escape). Rejects segments that would
    /// step outside the root.
    pub fn unescape(&self, escaped: &str) -> Result<PathBuf, NamespaceError> {
        let mut segments = escaped.split(DELIMITER);
        if segments.next() != Some(ROOT_TOKEN) {
            return Err(NamespaceError::MissingRoot(escaped.to_string()));
        }

        let mut path = self.root.clone();
        for raw in segments {
            let segment = decode_segment(raw).ok_or_else(|| illegal(escaped, raw))?;
            if !is_plain_name(&segment) {
                return Err(illegal(escaped, raw));
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Split a local path into the escaped path of its parent directory and
    /// its own name. The root itself has no parent and is rejected.
    pub fn locate(&self, path: &Path) -> Result<(String, String), NamespaceError> {
        let outside = || NamespaceError::OutsideRoot {
            path: path.to_path_buf(),
        };
        if path == self.root {
            return Err(outside());
        }
        let parent = path.parent().ok_or_else(outside)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NamespaceError::NonUtf8 {
                path: path.to_path_buf(),
            })?;
        Ok((self.escape(parent)?, name.to_string()))
    }

    /// Local path of the object `name` inside the escaped directory `dir`.
    pub fn resolve(&self, dir: &str, name: &str) -> Result<PathBuf, NamespaceError> {
        validate_name(name)?;
        Ok(self.unescape(dir)?.join(name))
    }
}

/// Add the `uid` segment right after the root token.
pub fn insert_user(escaped: &str, uid: UserId) -> String {
    match escaped.strip_prefix(ROOT_TOKEN) {
        Some(rest) => format!("{ROOT_TOKEN}{DELIMITER}{}{rest}", uid.0),
        None => escaped.to_string(),
    }
}

/// Remove the `uid` segment inserted by [`insert_user`]. Paths that do not
/// carry that segment are returned unchanged.
pub fn extract_user(escaped: &str, uid: UserId) -> String {
    let prefix = format!("{ROOT_TOKEN}{DELIMITER}{}", uid.0);
    match escaped.strip_prefix(&prefix) {
        Some(rest) if rest.is_empty() || rest.starts_with(DELIMITER) => {
            format!("{ROOT_TOKEN}{rest}")
        }
        _ => escaped.to_string(),
    }
}

/// Owner encoded in an escaped path, or [`UserId::NONE`] when the path has
/// no numeric user segment.
pub fn owner_of(escaped: &str) -> UserId {
    let Some(rest) = escaped.strip_prefix(ROOT_TOKEN) else {
        return UserId::NONE;
    };
    let Some(rest) = rest.strip_prefix(DELIMITER) else {
        return UserId::NONE;
    };
    let segment = rest.split(DELIMITER).next().unwrap_or_default();
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return UserId::NONE;
    }
    segment.parse().map(UserId).unwrap_or(UserId::NONE)
}

/// Escaped path of `name` inside the escaped directory `dir`.
pub fn join_escaped(dir: &str, name: &str) -> String {
    format!("{dir}{DELIMITER}{}", encode_segment(name))
}

/// True when `escaped` is `dir` itself or lies anywhere beneath it.
pub fn is_within(escaped: &str, dir: &str) -> bool {
    escaped == dir
        || escaped
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with(DELIMITER))
}

/// Names received from a peer must be a single plain path segment.
pub fn validate_name(name: &str) -> Result<(), NamespaceError> {
    if is_plain_name(name) {
        Ok(())
    } else {
        Err(NamespaceError::InvalidName(name.to_string()))
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for ch in segment.chars() {
        match ch {
            '%' => out.push_str("%25"),
            DELIMITER => out.push_str("%2C"),
            other => out.push(other),
        }
    }
    out
}

fn decode_segment(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        match code {
            "25" => out.push('%'),
            "2C" | "2c" => out.push(DELIMITER),
            _ => return None,
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}

fn illegal(path: &str, segment: &str) -> NamespaceError {
    NamespaceError::IllegalSegment {
        path: path.to_string(),
        segment: segment.to_string(),
    }
}
