use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug)]
struct PoolState {
    idle: Vec<Arc<File>>,
    /// Handles opened so far, idle or lent out.
    opened: usize,
}

/// Bounded set of read handles on one table file.
///
/// Starts with `initial` open handles and opens more on demand up to `max`.
/// Once every handle is lent out, `acquire` blocks until one comes back.
#[derive(Debug)]
pub struct ReaderPool {
    path: PathBuf,
    max: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl ReaderPool {
    pub fn new(path: impl Into<PathBuf>, initial: usize, max: usize) -> Result<Self> {
        let path = path.into();
        let max = max.max(1);
        let initial = initial.min(max);
        let idle = (0..initial)
            .map(|_| File::open(&path).map(Arc::new))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            path,
            max,
            state: Mutex::new(PoolState {
                opened: idle.len(),
                idle,
            }),
            returned: Condvar::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn opened(&self) -> Result<usize> {
        Ok(self.state.lock()?.opened)
    }

    /// Borrows a handle, waiting for one to be returned if the pool is exhausted.
    pub fn acquire(&self) -> Result<PooledReader<'_>> {
        let mut state = self.state.lock()?;
        loop {
            if let Some(file) = state.idle.pop() {
                return Ok(self.lend(file));
            }
            if state.opened < self.max {
                state.opened += 1;
                drop(state);
                return self.open_new();
            }
            state = self.returned.wait(state)?;
        }
    }

    /// Borrows a handle without blocking.
    pub fn try_acquire(&self) -> Result<Option<PooledReader<'_>>> {
        let mut state = self.state.lock()?;
        if let Some(file) = state.idle.pop() {
            return Ok(Some(self.lend(file)));
        }
        if state.opened < self.max {
            state.opened += 1;
            drop(state);
            return self.open_new().map(Some);
        }
        Ok(None)
    }

    fn open_new(&self) -> Result<PooledReader<'_>> {
        match File::open(&self.path) {
            Ok(file) => Ok(self.lend(Arc::new(file))),
            Err(e) => {
                if let Ok(mut state) = self.state.lock() {
                    state.opened -= 1;
                }
                self.returned.notify_one();
                Err(Error::Io(e))
            }
        }
    }

    fn lend(&self, file: Arc<File>) -> PooledReader<'_> {
        PooledReader { pool: self, file }
    }

    fn give_back(&self, file: Arc<File>) {
        if let Ok(mut state) = self.state.lock() {
            state.idle.push(file);
        }
        self.returned.notify_one();
    }
}

/// A handle on loan from a [`ReaderPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledReader<'a> {
    pool: &'a ReaderPool,
    file: Arc<File>,
}

impl Deref for PooledReader<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        &self.file
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        self.pool.give_back(self.file.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(initial: usize, max: usize) -> Result<(NamedTempFile, ReaderPool)> {
        let file = NamedTempFile::new()?;
        std::fs::write(file.path(), b"table")?;
        let pool = ReaderPool::new(file.path(), initial, max)?;
        Ok((file, pool))
    }

    #[test]
    fn test_grows_up_to_max() -> Result<()> {
        let (_file, pool) = pool(1, 3)?;
        assert_eq!(pool.opened()?, 1);

        let a = pool.acquire()?;
        let b = pool.acquire()?;
        let c = pool.acquire()?;
        assert_eq!(pool.opened()?, 3);
        assert!(pool.try_acquire()?.is_none());

        drop((a, b, c));
        assert!(pool.try_acquire()?.is_some());
        assert_eq!(pool.opened()?, 3);
        Ok(())
    }

    #[test]
    fn test_acquire_blocks_until_return() -> Result<()> {
        let (_file, pool) = pool(1, 1)?;
        let pool = Arc::new(pool);
        let held = pool.acquire()?;

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(held);
        waiter.join().expect("waiter panicked")?;
        Ok(())
    }

    #[test]
    fn test_returned_handle_is_reused() -> Result<()> {
        use std::os::unix::fs::FileExt;

        let (_file, pool) = pool(0, 1)?;
        let mut buf = [0u8; 5];
        for _ in 0..3 {
            let reader = pool.acquire()?;
            reader.read_exact_at(&mut buf, 0)?;
            assert_eq!(&buf, b"table");
        }
        assert_eq!(pool.opened()?, 1);
        assert!(pool.try_acquire()?.is_some());
        Ok(())
    }
}
