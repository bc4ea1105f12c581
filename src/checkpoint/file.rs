use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;

use super::Checkpoint;
use crate::error::{CorruptionKind, Error, Result};

const VALUE_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Writer,
    /// Monitoring handle; every `read` goes back to the file.
    ReadOnly,
}

/// Checkpoint persisted as a single little-endian `i64` file.
#[derive(Debug)]
pub struct FileCheckpoint {
    name: String,
    path: PathBuf,
    mode: Mode,
    file: Mutex<Option<File>>,
    last: AtomicI64,
    flushed: AtomicI64,
    notify: watch::Sender<i64>,
}

impl FileCheckpoint {
    /// Opens or creates the writable checkpoint at `path`.
    ///
    /// A newly created file is persisted with `initial` right away.
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>, initial: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let value = match read_value(&file, &path)? {
            Some(value) => value,
            None => {
                file.write_all_at(&initial.to_le_bytes(), 0)?;
                file.sync_all()?;
                initial
            }
        };

        Ok(Self::build(path, name.into(), Mode::Writer, Some(file), value))
    }

    /// Opens an existing checkpoint for monitoring only.
    pub fn open_read_only(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let value = read_value(&file, &path)?.ok_or_else(|| {
            Error::corrupt_db(CorruptionKind::BadCheckpoint("empty file".into()), &path)
        })?;

        Ok(Self::build(path, name.into(), Mode::ReadOnly, Some(file), value))
    }

    fn build(path: PathBuf, name: String, mode: Mode, file: Option<File>, value: i64) -> Self {
        let (notify, _) = watch::channel(value);
        Self {
            name,
            path,
            mode,
            file: Mutex::new(file),
            last: AtomicI64::new(value),
            flushed: AtomicI64::new(value),
            notify,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&self) -> Result<i64> {
        let guard = self.file.lock()?;
        let file = guard
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation(format!("checkpoint {} is closed", self.name)))?;
        let value = read_value(file, &self.path)?.unwrap_or(self.flushed.load(Ordering::Acquire));
        drop(guard);

        self.last.store(value, Ordering::Release);
        self.flushed.store(value, Ordering::Release);
        self.notify.send_if_modified(|current| {
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        });
        Ok(value)
    }
}

/// Reads the stored value; `None` for a freshly created empty file.
fn read_value(file: &File, path: &Path) -> Result<Option<i64>> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }
    if len != VALUE_SIZE {
        return Err(Error::corrupt_db(
            CorruptionKind::BadLength {
                expected: VALUE_SIZE,
                actual: len,
            },
            path,
        ));
    }
    let mut buf = [0u8; VALUE_SIZE as usize];
    file.read_exact_at(&mut buf, 0)?;
    Ok(Some(i64::from_le_bytes(buf)))
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        if self.mode == Mode::ReadOnly {
            match self.refresh() {
                Ok(value) => return value,
                Err(e) => {
                    tracing::warn!(checkpoint = %self.name, error = %e, "Failed to refresh checkpoint");
                }
            }
        }
        self.flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    fn write(&self, position: i64) {
        self.last.store(position, Ordering::Release);
    }

    fn flush(&self) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly(format!(
                "checkpoint {} was opened read-only",
                self.name
            )));
        }

        let last = self.last.load(Ordering::Acquire);
        if last == self.flushed.load(Ordering::Acquire) {
            return Ok(());
        }

        {
            let guard = self.file.lock()?;
            let file = guard.as_ref().ok_or_else(|| {
                Error::InvalidOperation(format!("checkpoint {} is closed", self.name))
            })?;
            file.write_all_at(&last.to_le_bytes(), 0)?;
            file.sync_data()?;
        }

        self.flushed.store(last, Ordering::Release);
        self.notify.send_replace(last);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.mode == Mode::Writer {
            self.flush()?;
        }
        self.file.lock()?.take();
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs;

    #[test]
    fn test_roundtrip_through_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.join("writer.chk");

        {
            let checkpoint = FileCheckpoint::open(&path, "writer", 0)?;
            assert_eq!(checkpoint.read(), 0);
            checkpoint.write(4096);
            checkpoint.flush()?;
            assert_eq!(checkpoint.read(), 4096);
            checkpoint.close()?;
        }

        let reopened = FileCheckpoint::open(&path, "writer", 0)?;
        assert_eq!(reopened.read(), 4096);
        Ok(())
    }

    #[test]
    fn test_unflushed_write_invisible_to_other_handle() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.join("writer.chk");

        let writer = FileCheckpoint::open(&path, "writer", 0)?;
        let monitor = FileCheckpoint::open_read_only(&path, "writer")?;

        writer.write(777);
        assert_eq!(writer.read_non_flushed(), 777);
        assert_eq!(monitor.read(), 0);

        writer.flush()?;
        assert_eq!(monitor.read(), 777);
        Ok(())
    }

    #[test]
    fn test_unflushed_write_lost_on_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.join("chaser.chk");

        {
            let checkpoint = FileCheckpoint::open(&path, "chaser", 0)?;
            checkpoint.write(12);
            checkpoint.flush()?;
            checkpoint.write(99);
        }

        let reopened = FileCheckpoint::open(&path, "chaser", 0)?;
        assert_eq!(reopened.read(), 12);
        Ok(())
    }

    #[test]
    fn test_read_only_handle_rejects_flush() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.join("epoch.chk");
        let _writer = FileCheckpoint::open(&path, "epoch", -1)?;

        let monitor = FileCheckpoint::open_read_only(&path, "epoch")?;
        assert_eq!(monitor.read(), -1);
        monitor.write(5);
        assert!(matches!(monitor.flush(), Err(Error::ReadOnly(_))));
        Ok(())
    }

    #[test]
    fn test_bad_length_is_corruption() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.join("writer.chk");
        fs::write(&path, [1u8, 2, 3])?;

        let result = FileCheckpoint::open(&path, "writer", 0);
        assert!(matches!(
            result,
            Err(Error::CorruptDatabase(CorruptionKind::BadLength { .. }, _))
        ));
        Ok(())
    }
}
