//! Durable position markers into the transaction log.
//!
//! A checkpoint carries two values: the last value *written* through the
//! owning handle and the last value *flushed*. Only flushed values are
//! visible to other handles over the same backing store and only flushed
//! values survive a crash. Writers batch many appends between flushes.
//!
//! ```text
//!   write(v) ──► last (private to this handle)
//!   flush()  ──► flushed + persisted + broadcast to subscribers
//! ```

mod file;
mod memory;

pub use file::FileCheckpoint;
pub use memory::InMemoryCheckpoint;

use std::fmt;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Named checkpoints a store keeps next to its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    Writer,
    Chaser,
    Epoch,
    Truncate,
    Replication,
}

impl CheckpointKind {
    pub const ALL: [CheckpointKind; 5] = [
        CheckpointKind::Writer,
        CheckpointKind::Chaser,
        CheckpointKind::Epoch,
        CheckpointKind::Truncate,
        CheckpointKind::Replication,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CheckpointKind::Writer => "writer",
            CheckpointKind::Chaser => "chaser",
            CheckpointKind::Epoch => "epoch",
            CheckpointKind::Truncate => "truncate",
            CheckpointKind::Replication => "replication",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.chk", self.name())
    }

    /// Value a checkpoint starts at before anything was recorded.
    pub fn initial_value(&self) -> i64 {
        match self {
            CheckpointKind::Writer | CheckpointKind::Chaser => 0,
            _ => -1,
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait Checkpoint: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Last flushed value.
    fn read(&self) -> i64;

    /// Last written value, flushed or not.
    fn read_non_flushed(&self) -> i64;

    fn write(&self, position: i64);

    /// Persists the last written value and publishes it to subscribers.
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Receiver observing flushed values.
    fn subscribe(&self) -> watch::Receiver<i64>;
}

/// Waits until the flushed value of `checkpoint` reaches `at_least`.
pub async fn wait_for(checkpoint: &dyn Checkpoint, at_least: i64) -> Result<i64> {
    let mut rx = checkpoint.subscribe();
    let value = rx
        .wait_for(|position| *position >= at_least)
        .await
        .map_err(|_| {
            Error::InvalidOperation(format!("checkpoint {} was closed", checkpoint.name()))
        })?;
    Ok(*value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_kind_names() {
        assert_eq!(CheckpointKind::Writer.file_name(), "writer.chk");
        assert_eq!(CheckpointKind::Writer.initial_value(), 0);
        assert_eq!(CheckpointKind::Epoch.initial_value(), -1);
        assert_eq!(CheckpointKind::ALL.len(), 5);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_after_flush() -> Result<()> {
        let checkpoint = Arc::new(InMemoryCheckpoint::new("writer", 0));

        let waiter = {
            let checkpoint = checkpoint.clone();
            tokio::spawn(async move { wait_for(checkpoint.as_ref(), 100).await })
        };

        checkpoint.write(100);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "write alone must not release waiters");

        checkpoint.flush()?;
        let value = waiter
            .await
            .map_err(|e| Error::InvalidOperation(e.to_string()))??;
        assert_eq!(value, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_already_reached() -> Result<()> {
        let checkpoint = InMemoryCheckpoint::new("chaser", 42);
        assert_eq!(wait_for(&checkpoint, 10).await?, 42);
        Ok(())
    }
}
