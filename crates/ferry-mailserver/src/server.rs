//! The archive server attached to a node.
//!
//! Every envelope the node admits is queued for the archive writer. Historic
//! requests are validated, rate limited per peer, and answered with the
//! matching envelopes as direct messages followed by a completion packet.
//! Other mail servers may sync a slice of the archive; they get the same
//! records as sync response pages.
//!
//! Delivery is split in two halves joined by a one-slot channel: a producer
//! that queries the archive and pushes bundles, and a consumer that writes
//! them to the peer. Both halves give up when the request is cancelled or
//! the deadline passes, and the final packet gets a short grace period of
//! its own, so a peer that stops reading never pins a task.
use std::sync::Arc;
use std::time::Duration;

use ferry_protocol::wire::{
    encode_raw_batch, SyncResponse, P2P_MESSAGE_CODE, P2P_REQUEST_COMPLETE_CODE, P2P_SYNC_RESPONSE_CODE,
};
use ferry_protocol::{
    crypto, now_secs, Envelope, Hash, MailServer, MessagesRequest, OpeningKey, Peer, ProtocolError,
    ReceivedMessage, RequestCompletion, SyncMailRequest,
};
use ferry_transport::Packet;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archiver::{persist, ArchiveWriter};
use crate::cleaner::DbCleaner;
use crate::config::{MailServerConfig, StorageKind};
use crate::dbkey::DBKey;
use crate::error::{MailServerError, StorageError};
use crate::limiter::RequestRateLimiter;
use crate::metrics::MailServerMetrics;
use crate::request::{HistoricRequest, MessagesRequestPayload};
use crate::storage::{MemoryStore, SqliteStore, StorageBackend, StoredRecord};

/// msgpack bin header upper bound per envelope.
const BLOB_OVERHEAD: usize = 5;
/// Frame header, packet code and array header.
const PACKET_OVERHEAD: usize = 16;
/// Upper bound on delivering the completion once processing has ended.
const COMPLETION_SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// Sync page fields around the envelope array.
const SYNC_PAGE_OVERHEAD: usize = 16;

/// Result of a fully delivered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Zero when nothing matched.
    pub last_envelope_hash: Hash,
    /// Set when more records remain past this page.
    pub cursor: Option<DBKey>,
    pub envelopes: usize,
}

pub struct ArchiveServer {
    config: MailServerConfig,
    store: Arc<dyn StorageBackend>,
    keys: Vec<OpeningKey>,
    limiter: Option<Arc<RequestRateLimiter>>,
    cleaner: Option<Arc<DbCleaner>>,
    writer: Arc<ArchiveWriter>,
    metrics: Arc<MailServerMetrics>,
    quit: CancellationToken,
}

impl ArchiveServer {
    /// Open the storage named in `config`.
    pub fn open(config: MailServerConfig, metrics: Arc<MailServerMetrics>) -> Result<Self, MailServerError> {
        let store: Arc<dyn StorageBackend> = match &config.storage {
            StorageKind::Memory => Arc::new(MemoryStore::new()),
            StorageKind::Sqlite { path } => Arc::new(SqliteStore::open(path)?),
        };
        Self::with_storage(config, store, metrics)
    }

    pub fn with_storage(
        config: MailServerConfig,
        store: Arc<dyn StorageBackend>,
        metrics: Arc<MailServerMetrics>,
    ) -> Result<Self, MailServerError> {
        config.validate()?;

        let mut keys = Vec::new();
        if let Some(password) = &config.password {
            keys.push(OpeningKey::Symmetric(crypto::sym_key_from_password(password)));
        }
        if let Some(seed) = config.identity_seed {
            keys.push(OpeningKey::Asymmetric { seed });
        }

        let window = config.rate_limit_window();
        let limiter = (!window.is_zero()).then(|| Arc::new(RequestRateLimiter::new(window)));

        let cleaner = (config.retention_days > 0).then(|| {
            Arc::new(DbCleaner::new(
                Arc::clone(&store),
                config.retention(),
                config.cleaner_period_duration(),
                config.cleaner_batch_size,
                Arc::clone(&metrics),
            ))
        });

        let writer = Arc::new(ArchiveWriter::new(
            Arc::clone(&store),
            config.archive_queue_size,
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            store,
            keys,
            limiter,
            cleaner,
            writer,
            metrics,
            quit: CancellationToken::new(),
        })
    }

    /// Start the archive writer, the rate limiter sweep and the retention
    /// cleaner. Envelopes handed to [`MailServer::archive`] before this are
    /// queued, up to `archive_queue_size`.
    pub fn start(&self) {
        self.writer.start();
        if let Some(limiter) = &self.limiter {
            limiter.start();
        }
        if let Some(cleaner) = &self.cleaner {
            cleaner.start();
        }
        info!(
            retention_days = self.config.retention_days,
            rate_limit_secs = self.config.rate_limit_secs,
            "mail server started"
        );
    }

    /// Stop background tasks and cancel requests in flight. Final.
    pub fn stop(&self) {
        self.writer.stop();
        if let Some(limiter) = &self.limiter {
            limiter.stop();
        }
        if let Some(cleaner) = &self.cleaner {
            cleaner.stop();
        }
        if !self.quit.is_cancelled() {
            self.quit.cancel();
            info!("mail server stopped");
        }
    }

    pub fn config(&self) -> &MailServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MailServerMetrics> {
        &self.metrics
    }

    pub fn cleaner(&self) -> Option<&Arc<DbCleaner>> {
        self.cleaner.as_ref()
    }

    pub fn writer(&self) -> &Arc<ArchiveWriter> {
        &self.writer
    }

    /// Write one envelope to the archive, bypassing the writer queue.
    pub fn archive_envelope(&self, envelope: &Envelope) -> Result<DBKey, MailServerError> {
        persist(self.store.as_ref(), envelope)
    }

    /// False, and counted, when the peer asked too recently.
    fn admit_peer(&self, peer: &Peer) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };
        if limiter.try_acquire(&peer.id().to_string()) {
            return true;
        }
        self.metrics.requests_rate_limited.inc();
        info!(peer = %peer.id().short(), "peer exceeded request rate limit");
        false
    }

    fn open_request(&self, envelope: &Envelope) -> Result<ReceivedMessage, MailServerError> {
        self.keys
            .iter()
            .find_map(|key| envelope.open(key).ok())
            .ok_or(MailServerError::Decryption)
    }

    /// Check PoW, decrypt, and validate an envelope request.
    pub fn decode_request(&self, envelope: &Envelope) -> Result<HistoricRequest, MailServerError> {
        if self.config.min_pow > 0.0 {
            let pow = envelope.pow();
            if pow < self.config.min_pow {
                return Err(MailServerError::LowPow {
                    pow,
                    required: self.config.min_pow,
                });
            }
        }
        let message = self.open_request(envelope)?;
        if message.src.is_none() {
            return Err(MailServerError::Unsigned);
        }
        let payload = MessagesRequestPayload::decode(&message.payload)?;
        HistoricRequest::from_payload(envelope.hash(), payload, now_secs(), self.config.max_limit)
    }

    /// Query the archive and push bundles into `output` until the page is
    /// done, `cancel` fires, `deadline` passes or the receiver is dropped.
    pub async fn process_request_in_bundles(
        &self,
        request: &HistoricRequest,
        cancel: &CancellationToken,
        deadline: Instant,
        output: mpsc::Sender<Vec<StoredRecord>>,
    ) -> Result<DeliveryOutcome, MailServerError> {
        self.produce(request, cancel, deadline, output, self.config.max_bundle_size).await
    }

    async fn produce(
        &self,
        request: &HistoricRequest,
        cancel: &CancellationToken,
        deadline: Instant,
        output: mpsc::Sender<Vec<StoredRecord>>,
        max_bundle_bytes: usize,
    ) -> Result<DeliveryOutcome, MailServerError> {
        let store = Arc::clone(&self.store);
        let query = request.query();
        let mut records = tokio::task::spawn_blocking(move || store.query(&query))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))??;

        let limit = request.limit as usize;
        let cursor = if records.len() > limit {
            records.truncate(limit);
            records.last().map(|r| r.key)
        } else {
            None
        };
        let last_envelope_hash = records.last().map(|r| r.key.envelope_hash()).unwrap_or_default();
        let envelopes = records.len();

        for bundle in bundle_records(records, max_bundle_bytes) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MailServerError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(MailServerError::Timeout),
                sent = output.send(bundle) => {
                    if sent.is_err() {
                        return Err(MailServerError::Cancelled);
                    }
                }
            }
        }

        Ok(DeliveryOutcome {
            last_envelope_hash,
            cursor,
            envelopes,
        })
    }

    async fn send_bundle(&self, peer: &Peer, bundle: &[StoredRecord], mode: Delivery) -> Result<(), MailServerError> {
        let raw: Vec<Vec<u8>> = bundle.iter().map(|r| r.raw.clone()).collect();
        match mode {
            Delivery::Direct { batch: true } => {
                peer.send(Packet::new(P2P_MESSAGE_CODE, encode_raw_batch(&raw)?)).await?;
            }
            Delivery::Direct { batch: false } => {
                for one in raw.chunks(1) {
                    peer.send(Packet::new(P2P_MESSAGE_CODE, encode_raw_batch(one)?)).await?;
                }
            }
            Delivery::Sync => {
                peer.send(Packet::new(P2P_SYNC_RESPONSE_CODE, SyncResponse::page(raw).to_bytes()?))
                    .await?;
            }
        }
        self.metrics.bundles_sent.inc();
        self.metrics.bundle_size.observe(bundle.len() as u64);
        self.metrics.envelopes_delivered.inc_by(bundle.len() as u64);
        Ok(())
    }

    /// Send the packet that closes a request. A peer that is not reading
    /// gets [`COMPLETION_SEND_TIMEOUT`] before the packet is dropped.
    async fn send_final(&self, peer: &Peer, code: u8, payload: Result<Vec<u8>, ProtocolError>) {
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %peer.id().short(), code, "failed to encode final response: {e}");
                return;
            }
        };
        match tokio::time::timeout(COMPLETION_SEND_TIMEOUT, peer.send(Packet::new(code, payload))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(peer = %peer.id().short(), code, "failed to send final response: {e}"),
            Err(_) => warn!(peer = %peer.id().short(), code, "peer stalled, final response dropped"),
        }
    }

    /// Run the producer and the peer writer for one request until both
    /// finish. Every write is bounded by the processing deadline.
    async fn deliver_in_bundles(
        &self,
        peer: &Peer,
        request: &HistoricRequest,
        mode: Delivery,
    ) -> Result<DeliveryOutcome, MailServerError> {
        let deadline = Instant::now() + self.config.processing_timeout_duration();
        let cancel = self.quit.child_token();
        let (tx, mut rx) = mpsc::channel::<Vec<StoredRecord>>(1);
        let max_bundle_bytes = match mode {
            Delivery::Direct { .. } => self.config.max_bundle_size,
            Delivery::Sync => self.config.max_bundle_size.saturating_sub(SYNC_PAGE_OVERHEAD),
        };

        let producer = self.produce(request, &cancel, deadline, tx, max_bundle_bytes);
        let consumer = async {
            while let Some(bundle) = rx.recv().await {
                // A peer that stops reading must not hold the request past its deadline.
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(MailServerError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(MailServerError::Timeout),
                    sent = self.send_bundle(peer, &bundle, mode) => sent,
                };
                if let Err(e) = sent {
                    cancel.cancel();
                    return Err(e);
                }
            }
            Ok(())
        };
        match tokio::join!(producer, consumer) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (_, Err(e)) | (Err(e), Ok(())) => Err(e),
        }
    }

    /// Deliver a validated request and report the outcome to the peer.
    pub async fn serve(&self, peer: &Peer, request: HistoricRequest) {
        let started = Instant::now();
        let mode = Delivery::Direct { batch: request.batch };
        let completion = match self.deliver_in_bundles(peer, &request, mode).await {
            Ok(outcome) => {
                self.metrics.requests_completed.inc();
                debug!(
                    peer = %peer.id().short(),
                    id = %request.id,
                    envelopes = outcome.envelopes,
                    more = outcome.cursor.is_some(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "historic request served"
                );
                RequestCompletion::Completed {
                    request_id: request.id,
                    last_envelope_hash: outcome.last_envelope_hash,
                    cursor: outcome.cursor.map(|c| c.cursor()).unwrap_or_default(),
                }
            }
            Err(e) => {
                if matches!(e, MailServerError::Cancelled) {
                    self.metrics.requests_cancelled.inc();
                } else {
                    self.metrics.requests_failed.inc();
                }
                warn!(peer = %peer.id().short(), id = %request.id, "historic request failed: {e}");
                RequestCompletion::Failed {
                    request_id: request.id,
                    error: e.to_string(),
                }
            }
        };
        self.send_final(peer, P2P_REQUEST_COMPLETE_CODE, completion.to_bytes()).await;
    }

    /// Stream a validated sync to another mail server, page by page, and
    /// close it with a final page carrying the resume cursor or the error.
    pub async fn serve_sync(&self, peer: &Peer, request: HistoricRequest) {
        let started = Instant::now();
        let last = match self.deliver_in_bundles(peer, &request, Delivery::Sync).await {
            Ok(outcome) => {
                self.metrics.sync_completed.inc();
                info!(
                    peer = %peer.id().short(),
                    envelopes = outcome.envelopes,
                    more = outcome.cursor.is_some(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "finished syncing envelopes"
                );
                SyncResponse::finished(outcome.cursor.map(|c| c.cursor()).unwrap_or_default())
            }
            Err(e) => {
                self.metrics.sync_failed.inc();
                warn!(peer = %peer.id().short(), "sync failed: {e}");
                SyncResponse::failed(e.to_string())
            }
        };
        self.send_final(peer, P2P_SYNC_RESPONSE_CODE, last.to_bytes()).await;
    }
}

/// How bundles reach the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Direct messages; `batch` packs a whole bundle into one packet.
    Direct { batch: bool },
    /// Sync response pages.
    Sync,
}

/// Group records into bundles that fit one packet of `max_bytes`. A record
/// larger than that travels alone.
fn bundle_records(records: Vec<StoredRecord>, max_bytes: usize) -> Vec<Vec<StoredRecord>> {
    let budget = max_bytes.saturating_sub(PACKET_OVERHEAD);
    let mut bundles = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for record in records {
        let cost = record.raw.len() + BLOB_OVERHEAD;
        if !current.is_empty() && size + cost > budget {
            bundles.push(std::mem::take(&mut current));
            size = 0;
        }
        size += cost;
        current.push(record);
    }
    if !current.is_empty() {
        bundles.push(current);
    }
    bundles
}

#[async_trait::async_trait]
impl MailServer for ArchiveServer {
    fn archive(&self, envelope: &Envelope) {
        self.writer.enqueue(envelope);
    }

    async fn deliver_mail(&self, peer: Arc<Peer>, request: Envelope) {
        self.metrics.requests_received.inc();
        if !self.admit_peer(&peer) {
            return;
        }
        match self.decode_request(&request) {
            Ok(request) => self.serve(&peer, request).await,
            Err(e) => {
                self.metrics.requests_invalid.inc();
                warn!(peer = %peer.id().short(), hash = %request.hash(), "dropping mail request: {e}");
            }
        }
    }

    async fn sync_mail(&self, peer: Arc<Peer>, request: SyncMailRequest) {
        self.metrics.sync_requests.inc();
        if !self.admit_peer(&peer) {
            return;
        }
        info!(peer = %peer.id().short(), lower = request.lower, upper = request.upper, "started syncing envelopes");
        match HistoricRequest::from_sync_request(&request, self.config.max_limit) {
            Ok(request) => self.serve_sync(&peer, request).await,
            Err(e) => {
                self.metrics.requests_invalid.inc();
                warn!(peer = %peer.id().short(), "dropping sync request: {e}");
            }
        }
    }

    async fn deliver(&self, peer: Arc<Peer>, request: MessagesRequest) {
        self.metrics.requests_received.inc();
        if !self.admit_peer(&peer) {
            return;
        }
        match HistoricRequest::from_messages_request(&request, self.config.max_limit) {
            Ok(request) => self.serve(&peer, request).await,
            Err(e) => {
                self.metrics.requests_invalid.inc();
                warn!(peer = %peer.id().short(), "dropping messages request: {e}");
            }
        }
    }
}

impl Drop for ArchiveServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ArchiveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveServer")
            .field("storage", &self.config.storage)
            .field("keys", &self.keys)
            .field("limiter", &self.limiter)
            .field("cleaner", &self.cleaner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::TopicType;

    fn record(ts: u32, len: usize) -> StoredRecord {
        StoredRecord {
            key: DBKey::new(ts, TopicType([1; 4]), Hash([ts as u8; 32])),
            raw: vec![0; len],
        }
    }

    #[test]
    fn bundles_respect_size() {
        let records: Vec<_> = (0..5).map(|i| record(i, 40)).collect();
        // Two records (2 * 45) fit in 116 - 16 = 100 bytes.
        let bundles = bundle_records(records, 116);
        let sizes: Vec<_> = bundles.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(bundles[2][0].key.timestamp(), 4);
    }

    #[test]
    fn oversized_record_travels_alone() {
        let records = vec![record(0, 10), record(1, 500), record(2, 10)];
        let sizes: Vec<_> = bundle_records(records, 100).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
        assert!(bundle_records(Vec::new(), 100).is_empty());
    }

    #[test]
    fn requires_key_material() {
        let err = ArchiveServer::with_storage(
            MailServerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MailServerMetrics::default()),
        )
        .unwrap_err();
        assert!(matches!(err, MailServerError::Config { .. }));
    }
}
