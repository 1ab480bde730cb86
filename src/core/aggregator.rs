//! Buffers per-file outcomes and flushes them to the execution log store in batches

use crate::db::{ExecutionLogStore, ExecutionRecord, ExecutionTotals, LogHandle, TransferOutcome};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Owned by exactly one run
pub struct ExecutionLogAggregator {
    store: Arc<dyn ExecutionLogStore>,
    record: ExecutionRecord,
    handle: Option<LogHandle>,
    pending: Vec<TransferOutcome>,
    batch_size: usize,
    /// Everything ever recorded, flushed or not
    recorded: ExecutionTotals,
    flushed: ExecutionTotals,
    finalized: bool,
}

impl ExecutionLogAggregator {
    /// Create the log record. A store failure here is not fatal: creation is
    /// retried at the next flush.
    pub async fn open(store: Arc<dyn ExecutionLogStore>, record: ExecutionRecord, batch_size: usize) -> Self {
        let handle = match store.create(&record).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(schedule_id = %record.schedule_id, "could not create execution log: {}", e);
                None
            }
        };

        Self {
            store,
            record,
            handle,
            pending: Vec::with_capacity(batch_size),
            batch_size: batch_size.max(1),
            recorded: ExecutionTotals::default(),
            flushed: ExecutionTotals::default(),
            finalized: false,
        }
    }

    pub fn handle(&self) -> Option<LogHandle> {
        self.handle
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Totals over every outcome recorded so far
    pub fn totals(&self) -> ExecutionTotals {
        self.recorded
    }

    /// Totals the store has acknowledged
    pub fn flushed_totals(&self) -> ExecutionTotals {
        self.flushed
    }

    /// Buffer one outcome, flushing when the batch is full
    pub async fn record(&mut self, outcome: TransferOutcome) {
        self.recorded.accumulate(std::slice::from_ref(&outcome));
        self.pending.push(outcome);

        if self.pending.len() >= self.batch_size {
            if let Err(e) = self.flush().await {
                // the buffer is kept and retried at the next boundary
                warn!(
                    schedule_id = %self.record.schedule_id,
                    "execution log flush failed, {} outcomes pending: {}",
                    self.pending.len(),
                    e
                );
            }
        }
    }

    /// Append the buffered outcomes. On failure the buffer is left intact.
    pub async fn flush(&mut self) -> SyncResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let handle = self.ensure_handle().await?;

        self.store.append(handle, &self.pending).await?;
        self.flushed.accumulate(&self.pending);
        debug!(
            schedule_id = %self.record.schedule_id,
            "flushed {} outcomes", self.pending.len()
        );
        self.pending.clear();
        Ok(())
    }

    /// Final flush, then mark the record terminal. Runs at most once.
    pub async fn finish(&mut self, end_time: DateTime<Utc>) -> SyncResult<()> {
        if self.finalized {
            return Err(SyncError::Persistence("execution log already finalized".to_string()));
        }

        let flushed = self.flush().await;
        if let Err(e) = &flushed {
            warn!(
                schedule_id = %self.record.schedule_id,
                "final flush failed, {} outcomes lost: {}",
                self.pending.len(),
                e
            );
        }

        let handle = self.ensure_handle().await?;
        self.store.finalize(handle, end_time).await?;
        self.finalized = true;
        flushed
    }

    async fn ensure_handle(&mut self) -> SyncResult<LogHandle> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }
        let handle = self.store.create(&self.record).await?;
        self.handle = Some(handle);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{OutcomeStatus, SyncMode};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records calls; fails the first `fail_appends` appends
    #[derive(Default)]
    struct MemoryStore {
        appends: Mutex<Vec<usize>>,
        files: Mutex<Vec<TransferOutcome>>,
        finalized: AtomicUsize,
        fail_appends: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionLogStore for MemoryStore {
        async fn create(&self, _record: &ExecutionRecord) -> SyncResult<LogHandle> {
            Ok(LogHandle(1))
        }

        async fn append(&self, _handle: LogHandle, outcomes: &[TransferOutcome]) -> SyncResult<()> {
            if self.fail_appends.load(Ordering::SeqCst) > 0 {
                self.fail_appends.fetch_sub(1, Ordering::SeqCst);
                return Err(SyncError::Persistence("disk full".into()));
            }
            self.appends.lock().unwrap().push(outcomes.len());
            self.files.lock().unwrap().extend_from_slice(outcomes);
            Ok(())
        }

        async fn finalize(&self, _handle: LogHandle, _end: DateTime<Utc>) -> SyncResult<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record() -> ExecutionRecord {
        ExecutionRecord::start("s1", SyncMode::Archive, "/src", "/dst")
    }

    fn copied(i: usize) -> TransferOutcome {
        TransferOutcome::new(format!("f{}", i), 10, OutcomeStatus::Copied)
    }

    #[tokio::test]
    async fn test_flushes_in_batches() {
        let store = Arc::new(MemoryStore::default());
        let mut agg = ExecutionLogAggregator::open(store.clone(), record(), 20).await;

        for i in 0..45 {
            agg.record(copied(i)).await;
        }
        assert_eq!(*store.appends.lock().unwrap(), vec![20, 20]);
        assert_eq!(agg.pending_len(), 5);

        agg.finish(Utc::now()).await.unwrap();
        assert_eq!(*store.appends.lock().unwrap(), vec![20, 20, 5]);
        assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(agg.flushed_totals().total_files, 45);
        assert_eq!(agg.flushed_totals().total_bytes, 450);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_at_next_boundary() {
        let store = Arc::new(MemoryStore::default());
        store.fail_appends.store(1, Ordering::SeqCst);
        let mut agg = ExecutionLogAggregator::open(store.clone(), record(), 2).await;

        agg.record(copied(0)).await;
        agg.record(copied(1)).await; // flush fails, buffer kept
        assert_eq!(agg.pending_len(), 2);

        agg.record(copied(2)).await; // retried with all three
        assert_eq!(agg.pending_len(), 0);
        assert_eq!(*store.appends.lock().unwrap(), vec![3]);

        let paths: Vec<String> = store.files.lock().unwrap().iter().map(|o| o.path.clone()).collect();
        assert_eq!(paths, vec!["f0", "f1", "f2"]);
    }

    #[tokio::test]
    async fn test_finish_runs_once() {
        let store = Arc::new(MemoryStore::default());
        let mut agg = ExecutionLogAggregator::open(store.clone(), record(), 20).await;
        agg.finish(Utc::now()).await.unwrap();
        assert!(agg.finish(Utc::now()).await.is_err());
        assert_eq!(store.finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_totals_exclude_deleted_and_error_bytes() {
        let store = Arc::new(MemoryStore::default());
        let mut agg = ExecutionLogAggregator::open(store, record(), 20).await;
        agg.record(TransferOutcome::new("a", 100, OutcomeStatus::Copied)).await;
        agg.record(TransferOutcome::new("b", 0, OutcomeStatus::Deleted)).await;
        agg.record(TransferOutcome::error("c", 70, "denied")).await;
        agg.record(TransferOutcome::new("d", 30, OutcomeStatus::Updated)).await;

        assert_eq!(agg.totals().total_files, 4);
        assert_eq!(agg.totals().total_bytes, 130);
    }
}
