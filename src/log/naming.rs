//! File naming for chunk files.
//!
//! Chunks are named `<prefix><index:06>.<version:06>`. A scavenge writes its
//! output under a temporary name and the manager renames it to the next
//! version of the same index when switching it in.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

const TEMP_SUFFIX: &str = ".scavenge.tmp";

pub trait FileNamingStrategy: Send + Sync {
    fn dir(&self) -> &Path;

    fn filename_for(&self, index: i32, version: i32) -> PathBuf;

    /// All versions of the given chunk index, newest first.
    fn all_versions_for(&self, index: i32) -> Result<Vec<PathBuf>>;

    /// Every chunk file in the directory, in name order.
    fn all_files(&self) -> Result<Vec<PathBuf>>;

    /// A fresh, unused temporary file name.
    fn temp_filename(&self) -> PathBuf;

    fn temp_files(&self) -> Result<Vec<PathBuf>>;

    fn parse_index(&self, path: &Path) -> Option<i32>;

    fn parse_version(&self, path: &Path) -> Option<i32>;

    /// Name for the next version of `index`: one past the newest existing one.
    fn best_version_filename(&self, index: i32) -> Result<PathBuf> {
        let next = self
            .all_versions_for(index)?
            .first()
            .and_then(|p| self.parse_version(p))
            .map_or(0, |v| v + 1);
        Ok(self.filename_for(index, next))
    }
}

#[derive(Debug)]
pub struct VersionedPatternNaming {
    dir: PathBuf,
    prefix: String,
    temp_counter: AtomicU64,
}

impl VersionedPatternNaming {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    fn file_name<'a>(&self, path: &'a Path) -> Option<&'a str> {
        path.file_name().and_then(|n| n.to_str())
    }

    fn split<'a>(&self, path: &'a Path) -> Option<(&'a str, &'a str)> {
        let name = self.file_name(path)?;
        let rest = name.strip_prefix(self.prefix.as_str())?;
        let (index, version) = rest.split_once('.')?;
        if index.len() != 6 || version.len() != 6 {
            return None;
        }
        Some((index, version))
    }

    fn list(&self, filter: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && filter(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl FileNamingStrategy for VersionedPatternNaming {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn filename_for(&self, index: i32, version: i32) -> PathBuf {
        self.dir
            .join(format!("{}{:06}.{:06}", self.prefix, index, version))
    }

    fn all_versions_for(&self, index: i32) -> Result<Vec<PathBuf>> {
        let mut files = self.list(|p| self.parse_index(p) == Some(index))?;
        files.sort_by_key(|p| std::cmp::Reverse(self.parse_version(p)));
        Ok(files)
    }

    fn all_files(&self) -> Result<Vec<PathBuf>> {
        self.list(|p| self.split(p).is_some())
    }

    fn temp_filename(&self) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        self.dir
            .join(format!("{:x}-{}-{}{}", nanos, std::process::id(), seq, TEMP_SUFFIX))
    }

    fn temp_files(&self) -> Result<Vec<PathBuf>> {
        self.list(|p| {
            self.file_name(p)
                .map_or(false, |name| name.ends_with(TEMP_SUFFIX))
        })
    }

    fn parse_index(&self, path: &Path) -> Option<i32> {
        self.split(path)?.0.parse().ok()
    }

    fn parse_version(&self, path: &Path) -> Option<i32> {
        self.split(path)?.1.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_filename_pattern() {
        let naming = VersionedPatternNaming::new("/data", "chunk-");
        let path = naming.filename_for(12, 3);
        assert_eq!(path, PathBuf::from("/data/chunk-000012.000003"));
        assert_eq!(naming.parse_index(&path), Some(12));
        assert_eq!(naming.parse_version(&path), Some(3));
        assert_eq!(naming.parse_index(Path::new("/data/other-000012.000003")), None);
        assert_eq!(naming.parse_index(Path::new("/data/chunk-12.3")), None);
    }

    #[test]
    fn test_versions_and_temp_files() -> Result<()> {
        let dir = TempDir::new()?;
        let naming = VersionedPatternNaming::new(dir.path(), "chunk-");

        fs::write(naming.filename_for(0, 0), b"")?;
        fs::write(naming.filename_for(0, 2), b"")?;
        fs::write(naming.filename_for(1, 0), b"")?;
        let temp = naming.temp_filename();
        fs::write(&temp, b"")?;

        let versions = naming.all_versions_for(0)?;
        assert_eq!(versions, vec![naming.filename_for(0, 2), naming.filename_for(0, 0)]);
        assert_eq!(naming.best_version_filename(0)?, naming.filename_for(0, 3));
        assert_eq!(naming.best_version_filename(5)?, naming.filename_for(5, 0));

        assert_eq!(naming.all_files()?.len(), 3);
        assert_eq!(naming.temp_files()?, vec![temp]);
        assert_ne!(naming.temp_filename(), naming.temp_filename());
        Ok(())
    }
}
