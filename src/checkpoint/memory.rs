use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::watch;

use super::Checkpoint;
use crate::error::Result;

/// Checkpoint with no backing file, for tests and transient state.
#[derive(Debug)]
pub struct InMemoryCheckpoint {
    name: String,
    last: AtomicI64,
    flushed: AtomicI64,
    notify: watch::Sender<i64>,
}

impl InMemoryCheckpoint {
    pub fn new(name: impl Into<String>, initial: i64) -> Self {
        let (notify, _) = watch::channel(initial);
        Self {
            name: name.into(),
            last: AtomicI64::new(initial),
            flushed: AtomicI64::new(initial),
            notify,
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn read_non_flushed(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    fn write(&self, position: i64) {
        self.last.store(position, Ordering::Release);
    }

    fn flush(&self) -> Result<()> {
        let last = self.last.load(Ordering::Acquire);
        self.flushed.store(last, Ordering::Release);
        self.notify.send_replace(last);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.notify.subscribe()
    }
}
