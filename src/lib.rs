pub mod checkpoint;
pub mod config;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod index;
pub mod log;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod tmpfs;

pub use checkpoint::{Checkpoint, CheckpointKind, FileCheckpoint, InMemoryCheckpoint};
pub use config::{IndexConfig, LogConfig, SchedulerConfig, StoreConfig};
pub use error::{CorruptionKind, Error, Result};
pub use hasher::Hasher;
pub use index::{IndexEntry, PTableVersion, TableIndex};
pub use log::{ChunkDb, LogReader, LogWriter};
pub use store::{Event, Store};
