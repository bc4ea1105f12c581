//! File naming for index tables.
//!
//! Tables are named `table-<sequence:08>`. The sequence resumes past the
//! largest name already present in the directory, so a table name is never
//! reused while an older file with that name may still be referenced.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

const TABLE_PREFIX: &str = "table-";

pub trait TableNaming: Send + Sync {
    fn dir(&self) -> &Path;

    /// A fresh, unused table file name.
    fn next_table_path(&self) -> PathBuf;

    /// True if `path` looks like a table this strategy produced.
    fn is_table(&self, path: &Path) -> bool;
}

#[derive(Debug)]
pub struct SequentialTableNaming {
    dir: PathBuf,
    next: AtomicU64,
}

impl SequentialTableNaming {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut next = 0;
        for entry in fs::read_dir(&dir)? {
            if let Some(seq) = parse_sequence(&entry?.path()) {
                next = next.max(seq + 1);
            }
        }
        Ok(Self {
            dir,
            next: AtomicU64::new(next),
        })
    }
}

fn parse_sequence(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let seq = name.strip_prefix(TABLE_PREFIX)?;
    if seq.len() != 8 {
        return None;
    }
    seq.parse().ok()
}

impl TableNaming for SequentialTableNaming {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_table_path(&self) -> PathBuf {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        self.dir.join(format!("{}{:08}", TABLE_PREFIX, seq))
    }

    fn is_table(&self, path: &Path) -> bool {
        parse_sequence(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_sequence_resumes_after_existing() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.join("table-00000007"), b"")?;
        fs::write(dir.join("table-7"), b"")?;
        fs::write(dir.join("indexmap"), b"")?;

        let naming = SequentialTableNaming::open(dir.path())?;
        assert_eq!(naming.next_table_path(), dir.join("table-00000008"));
        assert_eq!(naming.next_table_path(), dir.join("table-00000009"));
        assert!(naming.is_table(&dir.join("table-00000007")));
        assert!(!naming.is_table(&dir.join("table-7")));
        assert!(!naming.is_table(&dir.join("indexmap")));
        Ok(())
    }
}
