//! Directory walking and stat helpers.

use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;

use crate::error::{io_err, EngineError};

/// Every file and folder beneath `dir`, breadth first, so a folder always
/// precedes its contents. Symlinks are skipped. Directories that vanish
/// mid-walk are skipped as well.
pub(crate) fn walk(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut found = Vec::new();
    let mut queue = vec![dir.to_path_buf()];
    let mut cursor = 0;
    while cursor < queue.len() {
        let current = queue[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        let mut level = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                queue.push(entry.path());
                level.push(entry.path());
            } else if ty.is_file() {
                level.push(entry.path());
            }
        }
        level.sort();
        found.extend(level);
    }
    Ok(found)
}

/// Metadata of a regular file or directory, `None` when the path is gone or
/// is some other kind of object.
pub(crate) fn stat(path: &Path) -> Result<Option<Metadata>, EngineError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() || meta.is_dir() => Ok(Some(meta)),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

pub(crate) fn modified_at(path: &Path, meta: &Metadata) -> Result<DateTime<Utc>, EngineError> {
    let modified = meta.modified().map_err(|e| io_err(path, e))?;
    Ok(DateTime::<Utc>::from(modified))
}

pub(crate) fn set_modified(path: &Path, at: DateTime<Utc>) -> Result<(), EngineError> {
    let time = FileTime::from_unix_time(at.timestamp(), at.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, time).map_err(|e| io_err(path, e))
}

pub(crate) fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walk_lists_parents_before_children() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("b/deep")).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("b/deep/c.txt"), b"c").unwrap();

        let found: Vec<_> = walk(root)
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b"),
                PathBuf::from("b/deep"),
                PathBuf::from("b/deep/c.txt"),
            ]
        );
    }

    #[test]
    fn walk_of_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(walk(&tmp.path().join("gone")).unwrap().is_empty());
    }

    #[test]
    fn extension_without_dot() {
        assert_eq!(extension("report.tar.gz"), "gz");
        assert_eq!(extension("Makefile"), "");
    }
}
