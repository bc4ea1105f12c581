use std::sync::Arc;
use std::time::Duration;

use super::Store;
use crate::error::{Error, Result};
use crate::scheduler::{BackgroundTask, Context, Scheduler};

/// Runs blocking store work off the async worker threads.
async fn run_blocking<T, F>(store: &Arc<Store>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| Error::InvalidOperation(format!("blocking task join error: {}", e)))?
}

/// Writes memtables that have filled up to index tables.
pub struct IndexFlushTask {
    store: Arc<Store>,
}

impl IndexFlushTask {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for IndexFlushTask {
    fn name(&self) -> &'static str {
        "index-flush"
    }

    fn interval(&self) -> Duration {
        self.store.config.scheduler.index_flush_interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let flushed = run_blocking(&self.store, |store| store.flush_pending_index()).await?;
        if flushed > 0 {
            tracing::debug!(task = ctx.task_name, run_id = ctx.run_id, memtables = flushed, "Flushed index");
        }
        Ok(())
    }
}

/// Makes appended events durable and visible to readers.
pub struct CheckpointFlushTask {
    store: Arc<Store>,
}

impl CheckpointFlushTask {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CheckpointFlushTask {
    fn name(&self) -> &'static str {
        "checkpoint-flush"
    }

    fn interval(&self) -> Duration {
        self.store.config.scheduler.checkpoint_flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        run_blocking(&self.store, |store| store.flush()).await
    }
}

pub struct MetricsTask {
    store: Arc<Store>,
}

impl MetricsTask {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.store.config.scheduler.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.store.collect_metrics().map(|_| ())
    }
}

/// Registers the store's periodic tasks on `scheduler`.
pub fn register_tasks(store: &Arc<Store>, scheduler: &Scheduler) -> Result<()> {
    scheduler
        .register(Arc::new(IndexFlushTask::new(store.clone())))?
        .register(Arc::new(CheckpointFlushTask::new(store.clone())))?
        .register(Arc::new(MetricsTask::new(store.clone())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointKind;
    use crate::config::{IndexConfig, LogConfig, SchedulerConfig, StoreConfig};
    use crate::tmpfs::TempDir;

    #[tokio::test]
    async fn test_tasks_flush_log_and_index() -> Result<()> {
        let dir = TempDir::new()?;
        let config = StoreConfig::new(dir.path())
            .log(LogConfig::default().chunk_size(64 * 1024))
            .index(IndexConfig::default().max_memtable_entries(4).index_cache_depth(4))
            .scheduler(
                SchedulerConfig::default()
                    .index_flush_interval(Duration::from_millis(10))
                    .checkpoint_flush_interval(Duration::from_millis(10))
                    .metrics_interval(Duration::from_millis(10)),
            );
        let store = Arc::new(Store::open(config)?);
        let scheduler = Scheduler::new();
        register_tasks(&store, &scheduler)?;
        assert_eq!(scheduler.task_count()?, 3);

        let mut last = 0;
        for version in 0..10 {
            last = store.append_event(77, version, b"payload")?;
        }

        let flushed = tokio::time::timeout(
            Duration::from_secs(2),
            store.await_checkpoint(CheckpointKind::Writer, last + 1),
        )
        .await
        .expect("writer checkpoint not flushed")?;
        assert!(flushed > last);
        assert_eq!(store.read_event(77, 9)?.map(|e| e.version), Some(9));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.index().awaiting_count()?, 0);
        assert!(store.index().map()?.table_count() > 0);

        scheduler.shutdown().await?;
        store.close()
    }
}
