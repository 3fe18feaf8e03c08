//! Background archive writes.
//!
//! Admission hands envelopes to a bounded queue and returns at once. A
//! single writer task drains the queue in batches on the blocking pool. A
//! full queue drops the envelope and counts it in `archive_dropped`.
use std::sync::{Arc, Mutex};

use ferry_protocol::Envelope;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dbkey::DBKey;
use crate::error::{MailServerError, StorageError};
use crate::metrics::MailServerMetrics;
use crate::storage::StorageBackend;

/// Envelopes written per blocking call.
const WRITE_BATCH: usize = 64;

/// Write one envelope to `store` under its archive key.
pub(crate) fn persist(store: &dyn StorageBackend, envelope: &Envelope) -> Result<DBKey, MailServerError> {
    let key = DBKey::from(envelope);
    let raw = envelope.to_bytes()?;
    store.put(&key, &raw)?;
    Ok(key)
}

/// Queue in front of the archive store.
pub struct ArchiveWriter {
    store: Arc<dyn StorageBackend>,
    metrics: Arc<MailServerMetrics>,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ArchiveWriter {
    pub fn new(store: Arc<dyn StorageBackend>, capacity: usize, metrics: Arc<MailServerMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            store,
            metrics,
            tx,
            rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
        }
    }

    /// Queue an envelope without waiting. False when it was dropped.
    pub fn enqueue(&self, envelope: &Envelope) -> bool {
        match self.tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                self.metrics.archive_dropped.inc();
                warn!(hash = %envelope.hash(), "archive queue full, dropping envelope");
                false
            }
            Err(TrySendError::Closed(envelope)) => {
                self.metrics.archive_dropped.inc();
                debug!(hash = %envelope.hash(), "archive writer stopped, dropping envelope");
                false
            }
        }
    }

    /// Envelopes waiting for the writer.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Start draining the queue. Envelopes queued before the call are kept.
    /// The writer runs once: calls after [`stop`](Self::stop) are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let Some(mut rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let writer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let mut batch = vec![first];
                while batch.len() < WRITE_BATCH {
                    match rx.try_recv() {
                        Ok(envelope) => batch.push(envelope),
                        Err(_) => break,
                    }
                }
                writer.write_batch(batch).await;
            }

            // Flush what was accepted before the stop.
            rx.close();
            let mut rest = Vec::new();
            while let Ok(envelope) = rx.try_recv() {
                rest.push(envelope);
            }
            if !rest.is_empty() {
                writer.write_batch(rest).await;
            }
            debug!("archive writer stopped");
        });
        *task = Some((cancel, handle));
    }

    /// Stop the writer after it flushes the queue. No-op when not running.
    pub fn stop(&self) {
        if let Some((cancel, _handle)) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            cancel.cancel();
        }
    }

    async fn write_batch(self: &Arc<Self>, batch: Vec<Envelope>) {
        let writer = Arc::clone(self);
        let joined = tokio::task::spawn_blocking(move || {
            for envelope in &batch {
                writer.record(envelope, persist(writer.store.as_ref(), envelope));
            }
        })
        .await;
        if let Err(e) = joined {
            self.metrics.archive_errors.inc();
            warn!("archive write task failed: {}", StorageError::Join(e.to_string()));
        }
    }

    fn record(&self, envelope: &Envelope, result: Result<DBKey, MailServerError>) {
        match result {
            Ok(key) => {
                self.metrics.envelopes_archived.inc();
                trace!(?key, "archived envelope");
            }
            Err(e) => {
                self.metrics.archive_errors.inc();
                if matches!(e, MailServerError::Storage(StorageError::Panicked { .. })) {
                    self.metrics.storage_panics.inc();
                }
                warn!(hash = %envelope.hash(), "failed to archive envelope: {e}");
            }
        }
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::storage::{CursorQuery, MemoryStore, StoredRecord};
    use ferry_protocol::{now_secs, TopicType};

    /// Memory store whose writes take `delay`.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl StorageBackend for SlowStore {
        fn put(&self, key: &DBKey, raw: &[u8]) -> Result<(), StorageError> {
            std::thread::sleep(self.delay);
            self.inner.put(key, raw)
        }

        fn get(&self, key: &DBKey) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key)
        }

        fn query(&self, query: &CursorQuery) -> Result<Vec<StoredRecord>, StorageError> {
            self.inner.query(query)
        }

        fn prune(&self, before: u32, batch_size: usize) -> Result<usize, StorageError> {
            self.inner.prune(before, batch_size)
        }

        fn len(&self) -> Result<usize, StorageError> {
            self.inner.len()
        }
    }

    fn envelopes(count: u8) -> Vec<Envelope> {
        let now = now_secs();
        (0..count)
            .map(|i| Envelope::new(60, TopicType([1; 4]), vec![i; 8], now))
            .collect()
    }

    async fn settle(metrics: &MailServerMetrics, total: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.envelopes_archived.get() + metrics.archive_dropped.get() < total {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn slow_store_does_not_block_enqueue() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(100),
        });
        let metrics = Arc::new(MailServerMetrics::default());
        let writer = Arc::new(ArchiveWriter::new(store.clone(), 4, metrics.clone()));
        writer.start();

        let started = Instant::now();
        let accepted = envelopes(10).iter().filter(|e| writer.enqueue(e)).count();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(accepted >= 4);
        assert_eq!(metrics.archive_dropped.get(), (10 - accepted) as u64);

        settle(&metrics, 10).await;
        assert_eq!(metrics.envelopes_archived.get(), accepted as u64);
        assert_eq!(store.len().unwrap(), accepted);
        writer.stop();
    }

    #[tokio::test]
    async fn queued_before_start_and_flushed_on_stop() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MailServerMetrics::default());
        let writer = Arc::new(ArchiveWriter::new(store.clone(), 16, metrics.clone()));
        for e in envelopes(5).iter() {
            assert!(writer.enqueue(e));
        }
        assert_eq!(writer.pending(), 5);
        assert!(store.is_empty().unwrap());

        writer.start();
        writer.start();
        assert!(writer.is_running());
        settle(&metrics, 5).await;
        assert_eq!(store.len().unwrap(), 5);

        writer.stop();
        assert!(!writer.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.enqueue(&envelopes(1)[0]));
        assert_eq!(metrics.archive_dropped.get(), 1);
    }
}
