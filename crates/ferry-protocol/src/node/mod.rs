//! The node runtime: envelope pool, peers, local delivery and settings.
//!
//! A [`Node`] is shared as `Arc<Node>`. Each connection runs on the task
//! that calls [`Node::handle_peer`]; [`Node::start`] spawns the pool-wide
//! expiry loop, the delivery workers and the direct-message task. All of
//! them stop when [`Node::stop`] fires the shared cancellation token.
mod admission;
mod handlers;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ferry_transport::{MsgReadWriter, Packet, PeerId, RemotePeer, MAX_MESSAGE_SIZE};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bloom::Bloom;
use crate::config::NodeConfig;
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::events::{EnvelopeEvent, EventKind, EVENT_FEED_CAPACITY};
use crate::filter::{Filter, Filters};
use crate::mailserver::MailServer;
use crate::metrics::NodeMetrics;
use crate::options::{RateLimits, StatusOptions};
use crate::peer::{LocalMode, Peer};
use crate::pool::EnvelopePool;
use crate::rate_limiter::PeerRateLimiter;
use crate::settings::{system_time_source, Interest, Settings, SettingsStore, TimeSource};
use crate::types::{Hash, TopicType, EXPIRATION_CYCLE};
use crate::wire::{
    encode_batch, encode_raw_batch, MessagesRequest, P2pRequest, RequestCompletion, SyncMailRequest,
    P2P_MESSAGE_CODE, P2P_REQUEST_CODE, P2P_REQUEST_COMPLETE_CODE, P2P_SYNC_REQUEST_CODE,
};

/// Item on the direct-message queue. Events travel on the same queue so
/// a request completion is never observed before the envelopes it
/// delivered.
#[derive(Debug)]
pub(crate) enum P2pItem {
    Envelope(Arc<Envelope>),
    Event(EnvelopeEvent),
}

pub struct Node {
    config: NodeConfig,
    settings: SettingsStore,
    pool: Arc<EnvelopePool>,
    filters: Filters,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,

    msg_tx: mpsc::Sender<Arc<Envelope>>,
    msg_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Envelope>>>>,
    p2p_tx: mpsc::Sender<P2pItem>,
    p2p_rx: Mutex<Option<mpsc::Receiver<P2pItem>>>,
    overflow: AtomicBool,

    events: broadcast::Sender<EnvelopeEvent>,
    mail_server: RwLock<Option<Arc<dyn MailServer>>>,
    rate_limiter: RwLock<Option<Arc<PeerRateLimiter>>>,
    pending_requests: Arc<Mutex<HashMap<Hash, CancellationToken>>>,
    time_source: RwLock<TimeSource>,
    metrics: Arc<NodeMetrics>,

    quit: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig, metrics: Arc<NodeMetrics>) -> Arc<Self> {
        let interest = if config.full_node {
            Interest::full()
        } else if config.topic_interest_mode {
            Interest::Topics(HashSet::new())
        } else {
            Interest::Bloom(Bloom::empty())
        };
        let settings = Settings {
            max_message_size: config.max_message_size,
            confirmations_enabled: config.enable_confirmations,
            min_pow: config.min_pow,
            min_pow_tolerance: config.min_pow,
            interest: interest.clone(),
            interest_tolerance: interest,
            light_client: config.light_client,
            restrict_light_client_connections: config.restrict_light_client_connections,
            sync_allowance: config.sync_allowance,
            version: 0,
        };

        let (msg_tx, msg_rx) = mpsc::channel(config.queue_capacity);
        let (p2p_tx, p2p_rx) = mpsc::channel(config.queue_capacity);
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);

        Arc::new(Self {
            config,
            settings: SettingsStore::new(settings),
            pool: Arc::new(EnvelopePool::new()),
            filters: Filters::new(),
            peers: RwLock::new(HashMap::new()),
            msg_tx,
            msg_rx: Arc::new(tokio::sync::Mutex::new(msg_rx)),
            p2p_tx,
            p2p_rx: Mutex::new(Some(p2p_rx)),
            overflow: AtomicBool::new(false),
            events,
            mail_server: RwLock::new(None),
            rate_limiter: RwLock::new(None),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            time_source: RwLock::new(system_time_source()),
            metrics,
            quit: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the expiry loop, the delivery workers and the direct-message
    /// task. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(p2p_rx) = self.p2p_rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            debug!("node already started");
            return;
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.update().await }));

        let workers = self.config.worker_count();
        for _ in 0..workers {
            let node = Arc::clone(self);
            tasks.push(tokio::spawn(async move { node.process_queue().await }));
        }

        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.process_p2p(p2p_rx).await }));
        info!(workers, "node started");
    }

    /// Signal every background loop to return.
    pub fn stop(&self) {
        self.quit.cancel();
        for peer in self.peers() {
            peer.stop();
        }
        info!("node stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.quit.is_cancelled()
    }

    async fn update(&self) {
        let mut expire = tokio::time::interval(EXPIRATION_CYCLE);
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return,
                _ = expire.tick() => self.expire(),
            }
        }
    }

    /// Drop expired envelopes from the pool.
    pub fn expire(&self) {
        let removed = self.pool.expire(self.now());
        if removed.is_empty() {
            return;
        }
        self.metrics.envelopes_expired.inc_by(removed.len() as u64);
        self.metrics.pool_size.set(self.pool.len() as i64);
        for hash in removed {
            self.emit(EnvelopeEvent::new(EventKind::EnvelopeExpired, hash));
        }
    }

    async fn process_queue(&self) {
        loop {
            let envelope = {
                let mut rx = self.msg_rx.lock().await;
                tokio::select! {
                    _ = self.quit.cancelled() => return,
                    e = rx.recv() => e,
                }
            };
            let Some(envelope) = envelope else { return };
            self.deliver_locally(&envelope, false);
        }
    }

    async fn process_p2p(&self, mut rx: mpsc::Receiver<P2pItem>) {
        loop {
            let item = tokio::select! {
                _ = self.quit.cancelled() => return,
                item = rx.recv() => item,
            };
            match item {
                Some(P2pItem::Envelope(envelope)) => self.deliver_locally(&envelope, true),
                Some(P2pItem::Event(event)) => self.emit(event),
                None => return,
            }
        }
    }

    fn deliver_locally(&self, envelope: &Envelope, is_p2p: bool) {
        self.filters.notify_watchers(envelope, is_p2p);
        self.emit(EnvelopeEvent::new(EventKind::EnvelopeAvailable, envelope.hash()).with_topic(envelope.topic));
    }

    pub(crate) fn emit(&self, event: EnvelopeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Peers ────────────────────────────────────────────────────────

    /// Run one connection to completion: handshake, broadcast loop and
    /// message loop. Returns why the peer was disconnected.
    pub async fn handle_peer(
        self: &Arc<Self>,
        remote: RemotePeer,
        rw: Arc<dyn MsgReadWriter>,
    ) -> Result<(), ProtocolError> {
        let peer = Arc::new(Peer::new(remote, rw, self.pool.clone(), self.events.clone()));
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.id(), peer.clone());
        self.metrics.peers.inc();

        let result = self.run_peer(&peer).await;

        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            if peers.get(&peer.id()).is_some_and(|p| Arc::ptr_eq(p, &peer)) {
                peers.remove(&peer.id());
            }
        }
        self.metrics.peers.dec();
        peer.stop();
        peer.rw().close();
        if let Err(e) = &result {
            debug!(peer = %peer.id().short(), "peer disconnected: {e}");
        }
        result
    }

    async fn run_peer(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<(), ProtocolError> {
        if let Err(e) = peer.handshake(&self.status_options(), self.local_mode()).await {
            warn!(peer = %peer.id().short(), "handshake failed: {e}");
            return Err(e);
        }
        let _updater = peer.start();

        let limiter = self.rate_limiter.read().unwrap_or_else(|e| e.into_inner()).clone();
        match limiter {
            Some(limiter) => {
                limiter
                    .decorate(peer, |rw| self.run_message_loop(Arc::clone(peer), rw))
                    .await
            }
            None => self.run_message_loop(Arc::clone(peer), Arc::clone(peer.rw())).await,
        }
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get_peer(&self, id: &PeerId) -> Result<Arc<Peer>, ProtocolError> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownPeer(id.short()))
    }

    fn local_mode(&self) -> LocalMode {
        self.settings.read(|s| LocalMode {
            light_client: s.light_client,
            restrict_light_client_connections: s.restrict_light_client_connections,
        })
    }

    /// Options advertised in our `status` packet.
    pub fn status_options(&self) -> StatusOptions {
        let rate_limits = self.rate_limits();
        self.settings.read(|s| {
            let (bloom_filter, topic_interest) = match &s.interest {
                Interest::Bloom(b) => (Some(b.as_bytes().to_vec()), None),
                Interest::Topics(t) => (None, Some(t.iter().copied().collect())),
            };
            StatusOptions {
                pow_requirement: Some(s.min_pow),
                bloom_filter,
                light_node_enabled: Some(s.light_client),
                confirmations_enabled: Some(s.confirmations_enabled),
                rate_limits: Some(rate_limits),
                topic_interest,
            }
        })
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub fn settings(&self) -> Settings {
        self.settings.snapshot()
    }

    pub fn min_pow(&self) -> f64 {
        self.settings.read(|s| s.min_pow)
    }

    pub fn min_pow_tolerance(&self) -> f64 {
        self.settings.read(|s| s.min_pow_tolerance)
    }

    pub fn interest(&self) -> Interest {
        self.settings.read(|s| s.interest.clone())
    }

    /// Aggregate bloom of our interest.
    pub fn bloom_filter(&self) -> Bloom {
        self.settings.read(|s| s.interest.bloom())
    }

    pub fn max_message_size(&self) -> usize {
        self.settings.read(|s| s.max_message_size)
    }

    pub fn light_client_mode(&self) -> bool {
        self.settings.read(|s| s.light_client)
    }

    pub fn confirmations_enabled(&self) -> bool {
        self.settings.read(|s| s.confirmations_enabled)
    }

    pub fn rate_limits(&self) -> RateLimits {
        match self.rate_limiter.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(limiter) => RateLimits {
                ip_limits: limiter.limit_per_sec_ip(),
                peer_id_limits: limiter.limit_per_sec_peer_id(),
                topic_limits: 0,
            },
            None => RateLimits::default(),
        }
    }

    /// Change the PoW floor and tell every peer.
    ///
    /// With `tolerate`, envelopes meeting the previous floor are still
    /// accepted for the sync allowance.
    pub async fn set_min_pow(self: &Arc<Self>, pow: f64, tolerate: bool) -> Result<(), ProtocolError> {
        if !pow.is_finite() || pow < 0.0 {
            return Err(ProtocolError::InvalidSetting {
                reason: format!("invalid PoW: {pow}"),
            });
        }
        let version = self.settings.update(|s| {
            s.min_pow = pow;
            if !tolerate {
                s.min_pow_tolerance = pow;
            }
        });
        for peer in self.peers() {
            if let Err(e) = retry_once(|| peer.notify_pow_requirement_change(pow)).await {
                warn!(peer = %peer.id().short(), "failed to notify peer about new pow requirement: {e}");
            }
        }
        self.schedule_tolerance_reset(version);
        Ok(())
    }

    /// Replace our interest with a bloom filter and tell every peer.
    pub async fn set_bloom_filter(self: &Arc<Self>, bloom: Bloom) {
        let version = self.settings.update(|s| s.interest = Interest::Bloom(bloom));
        for peer in self.peers() {
            if let Err(e) = retry_once(|| peer.notify_bloom_filter_change(&bloom)).await {
                warn!(peer = %peer.id().short(), "failed to notify peer about new bloom filter: {e}");
            }
        }
        self.schedule_tolerance_reset(version);
    }

    /// Replace our interest with an exact topic set and tell every peer.
    pub async fn set_topic_interest(self: &Arc<Self>, topics: HashSet<TopicType>) -> Result<(), ProtocolError> {
        if topics.len() > crate::types::MAX_TOPIC_INTEREST {
            return Err(ProtocolError::InvalidSetting {
                reason: format!("too many topics of interest: {}", topics.len()),
            });
        }
        let list: Vec<TopicType> = topics.iter().copied().collect();
        let version = self.settings.update(|s| s.interest = Interest::Topics(topics));
        for peer in self.peers() {
            if let Err(e) = retry_once(|| peer.notify_topic_interest_change(list.clone())).await {
                warn!(peer = %peer.id().short(), "failed to notify peer about new topic interest: {e}");
            }
        }
        self.schedule_tolerance_reset(version);
        Ok(())
    }

    /// After the sync allowance, tolerated values catch up with the current
    /// ones, unless another change happened meanwhile (its own timer wins).
    fn schedule_tolerance_reset(self: &Arc<Self>, version: u64) {
        let node = Arc::clone(self);
        let allowance = Duration::from_secs(u64::from(self.settings.read(|s| s.sync_allowance)));
        tokio::spawn(async move {
            tokio::select! {
                _ = node.quit.cancelled() => {}
                _ = tokio::time::sleep(allowance) => {
                    let applied = node.settings.update_if_version(version, |s| {
                        s.min_pow_tolerance = s.min_pow;
                        s.interest_tolerance = s.interest.clone();
                    });
                    if applied {
                        debug!(version, "tolerated settings reset");
                    }
                }
            }
        });
    }

    pub fn set_max_message_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::InvalidSetting {
                reason: format!("message size too large [{size}>{MAX_MESSAGE_SIZE}]"),
            });
        }
        self.settings.modify(|s| s.max_message_size = size);
        Ok(())
    }

    pub fn set_light_client_mode(&self, enabled: bool) {
        self.settings.modify(|s| s.light_client = enabled);
    }

    pub fn set_time_source(&self, source: TimeSource) {
        *self.time_source.write().unwrap_or_else(|e| e.into_inner()) = source;
    }

    /// Current time in unix seconds, from the configured source.
    pub fn now(&self) -> u32 {
        let source = self.time_source.read().unwrap_or_else(|e| e.into_inner()).clone();
        source()
    }

    pub fn register_mail_server(&self, server: Arc<dyn MailServer>) {
        *self.mail_server.write().unwrap_or_else(|e| e.into_inner()) = Some(server);
    }

    pub fn register_rate_limiter(&self, limiter: Arc<PeerRateLimiter>) {
        *self.rate_limiter.write().unwrap_or_else(|e| e.into_inner()) = Some(limiter);
    }

    fn mail_server(&self) -> Option<Arc<dyn MailServer>> {
        self.mail_server.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    // ── Filters ──────────────────────────────────────────────────────

    /// Install a filter and widen our interest so its topics are accepted.
    pub async fn subscribe(self: &Arc<Self>, filter: Filter) -> Result<String, ProtocolError> {
        let topics = filter.topics().to_vec();
        let id = self.filters.install(filter);

        match self.interest() {
            Interest::Bloom(current) => {
                let wanted = if topics.is_empty() {
                    Bloom::full()
                } else {
                    Bloom::from_topics(&topics)
                };
                if !current.matches(&wanted) {
                    self.set_bloom_filter(current.add(&wanted)).await;
                }
            }
            Interest::Topics(current) => {
                if topics.is_empty() {
                    self.set_bloom_filter(Bloom::full()).await;
                } else if !topics.iter().all(|t| current.contains(t)) {
                    let mut merged = current;
                    merged.extend(topics);
                    self.set_topic_interest(merged).await?;
                }
            }
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: &str) -> Result<(), ProtocolError> {
        if self.filters.uninstall(id) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidFilter {
                reason: format!("unknown filter id {id}"),
            })
        }
    }

    pub fn get_filter(&self, id: &str) -> Option<Arc<Filter>> {
        self.filters.get(id)
    }

    // ── Envelopes ────────────────────────────────────────────────────

    /// Inject a locally created envelope; it spreads on the next
    /// transmission cycles.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        match self.add(envelope, false).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProtocolError::InvalidEnvelope("failed to add envelope".into())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn envelopes(&self) -> Vec<Arc<Envelope>> {
        self.pool.envelopes().into_iter().map(|(_, e)| e).collect()
    }

    pub fn get_envelope(&self, hash: &Hash) -> Option<Arc<Envelope>> {
        self.pool.get(hash)
    }

    pub fn subscribe_envelope_events(&self) -> broadcast::Receiver<EnvelopeEvent> {
        self.events.subscribe()
    }

    /// True while the delivery queue is (or recently was) saturated.
    pub fn is_overflowing(&self) -> bool {
        self.overflow.load(std::sync::atomic::Ordering::Relaxed)
    }

    // ── Direct delivery and historic requests ────────────────────────

    /// Trust a peer: its direct messages and request completions are
    /// accepted from now on.
    pub fn allow_p2p_messages_from_peer(&self, id: &PeerId) -> Result<(), ProtocolError> {
        self.get_peer(id)?.set_trusted(true);
        Ok(())
    }

    /// Ask a mail server peer for archived envelopes with an encrypted
    /// request envelope.
    pub async fn request_historic_messages(&self, id: &PeerId, request: &Envelope) -> Result<(), ProtocolError> {
        self.request_historic_messages_with_timeout(id, request, Duration::ZERO)
            .await
    }

    /// Like [`request_historic_messages`](Self::request_historic_messages);
    /// a non-zero `timeout` emits `MailServerRequestExpired` unless the
    /// request completes first.
    pub async fn request_historic_messages_with_timeout(
        &self,
        id: &PeerId,
        request: &Envelope,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let peer = self.get_peer(id)?;
        peer.set_trusted(true);
        let hash = request.hash();

        self.emit(
            EnvelopeEvent::new(EventKind::MailServerRequestSent, hash)
                .with_peer(peer.id())
                .with_topic(request.topic),
        );
        let payload = P2pRequest::Envelope(request.clone()).encode()?;
        let sent = peer.send(Packet::new(P2P_REQUEST_CODE, payload)).await;
        if !timeout.is_zero() {
            self.expire_request_after(peer.id(), hash, timeout);
        }
        sent
    }

    /// Send a structured request to a mail server peer.
    pub async fn send_messages_request(&self, id: &PeerId, request: &MessagesRequest) -> Result<(), ProtocolError> {
        request.validate()?;
        let peer = self.get_peer(id)?;
        peer.set_trusted(true);
        let payload = P2pRequest::Structured(request.clone()).encode()?;
        peer.send(Packet::new(P2P_REQUEST_CODE, payload)).await?;
        self.emit(EnvelopeEvent::new(EventKind::MailServerRequestSent, request.request_id()).with_peer(peer.id()));
        Ok(())
    }

    /// Ask another mail server for a slice of its archive. The pages are
    /// archived locally as they arrive; the last one raises
    /// [`EventKind::MailServerSyncFinished`]. Needs a registered mail server
    /// to store the pages.
    pub async fn sync_messages(&self, id: &PeerId, request: &SyncMailRequest) -> Result<(), ProtocolError> {
        request.validate()?;
        let peer = self.get_peer(id)?;
        peer.set_trusted(true);
        peer.send(Packet::new(P2P_SYNC_REQUEST_CODE, request.to_bytes()?)).await?;
        debug!(peer = %peer.id().short(), lower = request.lower, upper = request.upper, "sync requested");
        Ok(())
    }

    fn expire_request_after(&self, peer: PeerId, hash: Hash, timeout: Duration) {
        let done = self.quit.child_token();
        let replaced = self
            .pending_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hash, done.clone());
        if let Some(previous) = replaced {
            previous.cancel();
        }
        let pending = Arc::clone(&self.pending_requests);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&hash);
                    let _ = events.send(EnvelopeEvent::new(EventKind::MailServerRequestExpired, hash).with_peer(peer));
                }
            }
        });
    }

    /// Number of historic requests still waiting for a completion or expiry.
    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forget a pending request so its expiry event never fires.
    pub(crate) fn complete_request(&self, hash: &Hash) {
        if let Some(token) = self
            .pending_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(hash)
        {
            token.cancel();
        }
    }

    /// Report the outcome of a historic request to the requesting peer.
    pub async fn send_historic_message_response(
        &self,
        id: &PeerId,
        completion: &RequestCompletion,
    ) -> Result<(), ProtocolError> {
        let peer = self.get_peer(id)?;
        peer.send(Packet::new(P2P_REQUEST_COMPLETE_CODE, completion.to_bytes()?))
            .await
    }

    /// Send envelopes directly to one peer, bypassing the pool.
    pub async fn send_p2p_message(&self, id: &PeerId, envelopes: &[Envelope]) -> Result<(), ProtocolError> {
        let peer = self.get_peer(id)?;
        peer.send(Packet::new(P2P_MESSAGE_CODE, encode_batch(envelopes)?)).await
    }

    /// Send already-encoded envelopes directly to one peer.
    pub async fn send_raw_p2p_direct(&self, id: &PeerId, raw: &[Vec<u8>]) -> Result<(), ProtocolError> {
        let peer = self.get_peer(id)?;
        peer.send(Packet::new(P2P_MESSAGE_CODE, encode_raw_batch(raw)?)).await
    }
}

/// Run `f`, retrying once on failure.
async fn retry_once<F, Fut>(f: F) -> Result<(), ProtocolError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), ProtocolError>>,
{
    match f().await {
        Ok(()) => Ok(()),
        Err(_) => f().await,
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("envelopes", &self.pool.len())
            .field("filters", &self.filters.len())
            .field("peers", &self.peers.read().map(|p| p.len()).unwrap_or(0))
            .finish()
    }
}
