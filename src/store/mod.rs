//! The event store: a chunked log with a stream index over it.
//!
//! ```text
//!   append_event ──► LogWriter ──► chunk files      (durable on flush)
//!        │
//!        └─────────► TableIndex ──► memtables ──► index tables
//!
//!   read_event ───► TableIndex lookup ──► LogReader at position
//! ```
//!
//! Background tasks flush the writer checkpoint and the index and log
//! metrics; they are optional and only need a tokio runtime.

mod event;
mod metrics;
#[allow(clippy::module_inception)]
mod store;
mod tasks;

pub use event::{decode_event, encode_event, Event, EVENT_HEADER_SIZE};
pub use metrics::StoreMetrics;
pub use store::Store;
pub use tasks::{register_tasks, CheckpointFlushTask, IndexFlushTask, MetricsTask};
