//! Stream index.
//!
//! ```text
//!   add(stream, version, position)
//!            |
//!            v
//!   +------------------+   full    +---------------------+
//!   | current MemTable | --------> | awaiting MemTables  |
//!   +------------------+           +---------------------+
//!                                            | flush_pending
//!                                            v
//!                                  +---------------------+
//!                                  | IndexMap            |
//!                                  |  L0: PTable PTable  |
//!                                  |  L1: PTable         |
//!                                  +---------------------+
//! ```
//!
//! Entries map a 64-bit stream hash and an event version to a log position.
//! Tables are immutable; merges produce new tables and retire the old ones
//! once their last reader lets go.

pub mod entry;
pub mod index_map;
pub mod memtable;
pub mod merge;
pub mod naming;
pub mod ptable;
pub mod table_index;

pub use entry::{IndexEntry, PTableVersion};
pub use index_map::{IndexMap, MergeContext, MergeResult};
pub use memtable::MemTable;
pub use naming::{SequentialTableNaming, TableNaming};
pub use ptable::{PTable, TableOptions};
pub use table_index::{IndexStats, TableIndex};
