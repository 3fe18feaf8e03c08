//! Periodic archive retention.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_protocol::now_secs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::metrics::MailServerMetrics;
use crate::storage::StorageBackend;

/// Deletes archived envelopes older than the retention period, one batch
/// per write.
pub struct DbCleaner {
    store: Arc<dyn StorageBackend>,
    retention: Duration,
    period: Duration,
    batch_size: usize,
    metrics: Arc<MailServerMetrics>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DbCleaner {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        retention: Duration,
        period: Duration,
        batch_size: usize,
        metrics: Arc<MailServerMetrics>,
    ) -> Self {
        Self {
            store,
            retention,
            period,
            batch_size: batch_size.max(1),
            metrics,
            task: Mutex::new(None),
        }
    }

    /// Remove every record sent before `before` (unix seconds).
    pub fn prune_entries_older_than(&self, before: u32) -> Result<usize, StorageError> {
        let removed = self.store.prune(before, self.batch_size)?;
        self.metrics.envelopes_pruned.inc_by(removed as u64);
        if removed > 0 {
            info!(removed, before, "pruned archived envelopes");
        } else {
            debug!(before, "nothing to prune");
        }
        Ok(removed)
    }

    fn cutoff(&self) -> u32 {
        let retention = u32::try_from(self.retention.as_secs()).unwrap_or(u32::MAX);
        now_secs().saturating_sub(retention)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Start pruning every period. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cleaner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(cleaner.period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let before = cleaner.cutoff();
                        let worker = Arc::clone(&cleaner);
                        let result = tokio::task::spawn_blocking(move || worker.prune_entries_older_than(before))
                            .await
                            .map_err(|e| StorageError::Join(e.to_string()))
                            .and_then(|r| r);
                        if let Err(e) = result {
                            warn!("failed to prune archive: {e}");
                        }
                    }
                }
            }
            debug!("db cleaner stopped");
        });
        *task = Some((cancel, handle));
    }

    /// Stop the loop. No-op when not running.
    pub fn stop(&self) {
        if let Some((cancel, _handle)) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }
    }
}

impl Drop for DbCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DbCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCleaner")
            .field("retention", &self.retention)
            .field("period", &self.period)
            .field("batch_size", &self.batch_size)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbkey::DBKey;
    use crate::storage::MemoryStore;
    use ferry_protocol::{Hash, TopicType};

    fn filled(count: u32, ts: impl Fn(u32) -> u32) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        for i in 0..count {
            let key = DBKey::new(ts(i), TopicType([1; 4]), Hash([i as u8; 32]));
            store.put(&key, &[i as u8]).unwrap();
        }
        store
    }

    fn cleaner(store: Arc<MemoryStore>, period: Duration) -> Arc<DbCleaner> {
        Arc::new(DbCleaner::new(
            store,
            Duration::from_secs(86_400),
            period,
            3,
            Arc::new(MailServerMetrics::default()),
        ))
    }

    #[test]
    fn prunes_incrementally() {
        // Records at 100, 110, ..., 190.
        let store = filled(10, |i| 100 + i * 10);
        let cleaner = cleaner(store.clone(), Duration::from_secs(60));

        assert_eq!(cleaner.prune_entries_older_than(100).unwrap(), 0);
        assert_eq!(cleaner.prune_entries_older_than(130).unwrap(), 3);
        assert_eq!(store.len().unwrap(), 7);
        assert_eq!(cleaner.prune_entries_older_than(175).unwrap(), 5);
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(cleaner.prune_entries_older_than(1_000).unwrap(), 2);
        assert!(store.is_empty().unwrap());
        assert_eq!(cleaner.metrics.envelopes_pruned.get(), 10);
    }

    #[tokio::test]
    async fn periodic_prune_keeps_recent() {
        let now = now_secs();
        let store = filled(6, |i| if i < 4 { 100 + i } else { now });
        let cleaner = cleaner(store.clone(), Duration::from_millis(50));

        cleaner.start();
        cleaner.start();
        assert!(cleaner.is_running());
        tokio::time::sleep(Duration::from_millis(300)).await;
        cleaner.stop();
        cleaner.stop();
        assert!(!cleaner.is_running());

        assert_eq!(store.len().unwrap(), 2);
    }
}
