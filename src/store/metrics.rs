use crate::index::IndexStats;

/// Snapshot of store sizes and positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetrics {
    pub chunks: usize,
    pub cached_chunks: usize,
    /// Position the next append lands at.
    pub writer_position: i64,
    /// Durable end of the log.
    pub flushed_position: i64,
    pub index: IndexStats,
}

pub fn log_metrics(metrics: &StoreMetrics) {
    tracing::info!(
        chunks = metrics.chunks,
        cached_chunks = metrics.cached_chunks,
        writer_position = metrics.writer_position,
        flushed_position = metrics.flushed_position,
        memtable_entries = metrics.index.current_memtable_entries,
        awaiting_memtables = metrics.index.awaiting_memtables,
        tables_per_level = ?metrics.index.tables_per_level,
        index_prepare = metrics.index.prepare_checkpoint,
        index_commit = metrics.index.commit_checkpoint,
        "Store metrics"
    );
}
