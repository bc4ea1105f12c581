//! The transaction log: an append-only sequence of fixed-size chunk files.
//!
//! ```text
//!  log position:  0             chunk_size     2*chunk_size
//!                 |  chunk 0     |  chunk 1     |  chunk 2 (active)  ...
//!                 +--------------+--------------+-------------
//!                 ^ completed     ^ completed    ^ writer appends here
//! ```
//!
//! The writer checkpoint is the durable end of the log. Everything below
//! it is readable, everything above it is discarded on open.

pub mod chunk;
pub mod db;
pub mod manager;
pub mod naming;
pub mod reader;
pub mod record;
pub mod scavenge;
pub mod writer;

pub use chunk::{Chunk, ChunkFooter, ChunkHeader, PosMap};
pub use db::ChunkDb;
pub use manager::ChunkManager;
pub use naming::{FileNamingStrategy, VersionedPatternNaming};
pub use reader::{LogChaser, LogReader, SeqReadResult};
pub use record::{LogRecord, RecordRead};
pub use scavenge::{MergeChunksResult, ScavengeResult, Scavenger};
pub use writer::LogWriter;
